use actix_web::{web, App, HttpServer};
use clap::Parser;

use unigate::config::Configuration;
use unigate::{server, util};

/// Multi-backend Chat Completions gateway.
#[derive(Debug, Parser)]
#[command(name = "unigate", version, about)]
struct Args {
    /// Path to the configuration document.
    #[arg(short, long, default_value = "config.json", env = "UNIGATE_CONFIG")]
    config: String,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Configuration::load_from_file(&args.config)?;
    util::init_tracing(config.debug);

    let bind_addr = config.bind_addr();
    let state = web::Data::new(util::AppState::from_config(&config));
    tracing::info!(
        config = args.config.as_str(),
        addr = bind_addr.as_str(),
        "starting gateway"
    );

    HttpServer::new(move || {
        App::new()
            .wrap(util::cors_config_from_env())
            .app_data(state.clone())
            .configure(server::config_routes)
    })
    .bind(&bind_addr)?
    .run()
    .await?;

    Ok(())
}
