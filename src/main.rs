#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use radsecproxy::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    radsecproxy::logger::init(&config)?;

    if config.clients.is_empty() && config.servers.is_empty() {
        log::warn!(
            "no Client or Server sections are configured, it's just a program without any functionality :-)"
        );
        return Ok(());
    }

    radsecproxy::startup(config).await
}
