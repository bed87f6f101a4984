/*! A Grafana backend data source plugin for [Trino].

The crate is divided into a few layers:

- [`interpolate`] and [`template`] render Grafana template variables into SQL literals.
- [`probe`] and [`datasource`] implement the connection test and the data source
  adapter over an injected [`QueryTransport`][probe::QueryTransport].
- [`settings`], [`token`] and [`client`] resolve the data source configuration and
  speak Trino's HTTP statement protocol.
- [`macros`] and [`convert`] expand time-range macros and turn Trino results into
  Grafana [`Frame`][grafana_plugin_sdk::data::Frame]s.
- [`plugin`] wires everything into the SDK's data and diagnostics services.

[Trino]: https://trino.io
*/
#![deny(missing_docs)]

pub mod client;
pub mod convert;
pub mod datasource;
pub mod interpolate;
pub mod macros;
pub mod plugin;
pub mod probe;
pub mod query;
pub mod settings;
pub mod template;
pub mod token;
