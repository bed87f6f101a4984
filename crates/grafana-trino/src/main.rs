use grafana_trino::plugin::TrinoPlugin;

#[grafana_plugin_sdk::main(services(data, diagnostics), init_subscriber = true)]
async fn plugin() -> TrinoPlugin {
    TrinoPlugin::default()
}
