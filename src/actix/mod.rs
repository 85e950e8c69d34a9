pub mod api;
pub mod helpers;

use std::sync::Arc;

use actix_web::middleware::Logger;
use actix_web::{web, App, HttpServer};
use virtual_file::VirtualFile;

use crate::actix::api::stream_api::{config_stream_api, StreamGate};
use crate::settings::{max_web_workers, Settings};

/// Serve `file` until the server is stopped.
pub fn init(file: Arc<VirtualFile>, settings: Settings) -> std::io::Result<()> {
    actix_web::rt::System::new().block_on(async {
        let file_data = web::Data::from(file);
        // Shared by all workers, the file has a single read cursor
        let gate = web::Data::new(StreamGate::default());
        let route = settings.service.route.clone();
        let server = HttpServer::new(move || {
            let route = route.clone();
            App::new()
                .wrap(Logger::default())
                .app_data(file_data.clone())
                .app_data(gate.clone())
                .configure(move |cfg| config_stream_api(cfg, &route))
        })
        .workers(max_web_workers(&settings));

        let bind_addr = format!("{}:{}", settings.service.host, settings.service.http_port);
        log::info!(
            "Streaming on http://{bind_addr}{}",
            settings.service.route
        );
        server.bind(bind_addr)?.run().await
    })
}
