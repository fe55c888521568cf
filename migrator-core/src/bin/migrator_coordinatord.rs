// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use migrator_common::SafeDisplay;
use migrator_core::bootstrap::Services;
use migrator_core::config::make_config_loader;
use prometheus::Registry;
use tokio::signal;
use tracing::{error, info};

fn main() -> Result<(), std::io::Error> {
    let Some(config) = make_config_loader().load_or_dump_config() else {
        return Ok(());
    };

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(&config))
}

async fn async_main(config: &migrator_core::config::MigratorConfig) -> Result<(), std::io::Error> {
    config.tracing.init("migrator-coordinatord");

    let registry = Registry::new();
    let _metrics = migrator_common::tracing_setup::CoreMetrics::register(&registry)
        .expect("Failed to register metrics");

    info!("starting migrator-coordinatord\n{}", config.to_safe_string());

    let services = match Services::new(config).await {
        Ok(services) => services,
        Err(error_message) => {
            error!(error = error_message, "failed to initialize services");
            return Ok(());
        }
    };

    signal::ctrl_c().await?;
    info!("shutdown signal received, draining running tasks");
    services.shutdown().await;

    Ok(())
}
