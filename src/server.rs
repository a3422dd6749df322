//! HTTP server wrapper: bind + serve a routing surface with graceful
//! shutdown.
//!
//! Generalized from the workspace's `HttpServer::new(...).bind(...).run()`
//! idiom (previously hard-coded to one WebSocket/GraphQL app) into a small
//! reusable helper both the broker (`service.rs`) and the client-side
//! adapter (`client::adapter`) build their `actix-web` apps on top of.

use actix_web::dev::ServerHandle;
use actix_web::{middleware, web, App, HttpServer};

/// A spawned `actix-web` server plus the handle needed to stop it
/// gracefully from outside the task that's running it.
pub struct RunningServer {
    handle: ServerHandle,
    join: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl RunningServer {
    pub async fn shutdown(self, graceful: bool) {
        self.handle.stop(graceful).await;
        let _ = self.join.await;
    }
}

/// Bind `host:port` and run an `actix-web` app built by `configure`,
/// wrapped with the standard request logger.
pub fn spawn_http_server<F>(host: &str, port: u16, configure: F) -> std::io::Result<RunningServer>
where
    F: Fn(&mut web::ServiceConfig) + Send + Clone + 'static,
{
    let server = HttpServer::new(move || {
        let configure = configure.clone();
        App::new().wrap(middleware::Logger::default()).configure(configure)
    })
    .bind((host, port))?
    .run();

    let handle = server.handle();
    let join = tokio::spawn(server);

    Ok(RunningServer { handle, join })
}
