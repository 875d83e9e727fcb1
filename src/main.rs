mod cli;
mod controllers;
mod error;

use std::{future::Future, net::SocketAddr};

use actix_web::{
    dev::Server, get, middleware, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser as _;
use cli::{Cli, Commands};
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

pub use crate::error::{ControllerError as Error, Result};

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(_req: HttpRequest) -> impl Responder {
    HttpResponse::Ok()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match args.commands() {
        Commands::Run(args) => {
            serve_until_done(
                controllers::ingress::run_controllers(args.clone()),
                build_server(args.health_addr())?,
            )
            .await?;
        }
    }

    Ok(())
}

fn build_server(addr: SocketAddr) -> Result<Server, std::io::Error> {
    let server = HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
    })
    .bind(addr)?
    .workers(2)
    .shutdown_timeout(5)
    .run();

    Ok(server)
}

/// Runs the health server alongside `controller` and stops it once the
/// controller is done, so a failed controller ends the process.
async fn serve_until_done<F>(controller: F, server: Server) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let handle = server.handle();
    let controller = async {
        let result = controller.await;
        handle.stop(true).await;
        result
    };
    let (controller, server) = tokio::join!(controller, server);
    server?;
    controller
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn failed_controller_stops_health_server() {
        let server = build_server("127.0.0.1:0".parse().unwrap()).unwrap();
        let controller = async { Err(Error::invalid_resource("unit")) };

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            serve_until_done(controller, server),
        )
        .await
        .expect("health server kept running");
        assert!(matches!(result, Err(Error::InvalidResource { .. })));
    }

    #[tokio::test]
    async fn finished_controller_stops_health_server() {
        let server = build_server("127.0.0.1:0".parse().unwrap()).unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            serve_until_done(async { Ok(()) }, server),
        )
        .await
        .expect("health server kept running");
        assert!(result.is_ok());
    }
}
