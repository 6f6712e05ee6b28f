// HTTP side of the firmware transfer: one upload route plus a status route

use std::sync::Arc;

use anyhow::{bail, Result};
use console_core::wire::{DIGEST_HEADER, SIZE_HEADER};
use console_core::{TransferEndpoint, TransferPhase, TransferService, TransferSnapshot, UpdatePartitions};
use embedded_svc::http::Method;
use embedded_svc::io::Write;
use esp_idf_svc::http::server::{Configuration, EspHttpServer};
use serde::Serialize;

use super::EspPartitions;

const UPLOAD_PATH: &str = "/ota/update";
const STATUS_PATH: &str = "/api/ota/status";

#[derive(Serialize)]
struct StatusReport<'a> {
    version: &'a str,
    running: &'a str,
    #[serde(flatten)]
    transfer: TransferSnapshot,
}

fn http_config() -> Configuration {
    Configuration {
        // Holds the chunk buffer while streaming into flash
        stack_size: 10240,
        max_uri_handlers: 4,
        max_open_sockets: 3,
        lru_purge_enable: true,
        ..Default::default()
    }
}

/// Brings the HTTP server up only while the orchestrator waits for an image
pub struct HttpTransferService {
    endpoint: Arc<TransferEndpoint<EspPartitions>>,
    server: Option<EspHttpServer<'static>>,
    // Stopped while a handler was still streaming. Dropping runs httpd_stop,
    // which waits for that handler, so it happens once the session is over.
    retiring: Option<EspHttpServer<'static>>,
    running_label: String,
}

impl HttpTransferService {
    pub fn new(endpoint: Arc<TransferEndpoint<EspPartitions>>) -> Self {
        let running_label = endpoint
            .with_partitions(|p| p.running_partition().map(|h| h.label.to_string()))
            .and_then(|r| r.ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            endpoint,
            server: None,
            retiring: None,
            running_label,
        }
    }

    fn build_server(&self) -> Result<EspHttpServer<'static>> {
        let mut server = EspHttpServer::new(&http_config())?;

        let endpoint = self.endpoint.clone();
        server.fn_handler(UPLOAD_PATH, Method::Post, move |mut req| {
            // Copy the headers out; the body read needs the request mutably
            let size = req.header(SIZE_HEADER).map(str::to_owned);
            let digest = req.header(DIGEST_HEADER).map(str::to_owned);

            match endpoint.receive(size.as_deref(), digest.as_deref(), &mut req) {
                Ok(receipt) => {
                    let mut response = req.into_ok_response()?;
                    let body = format!(
                        "Image verified: {} bytes in {}, restarting",
                        receipt.bytes, receipt.partition.label
                    );
                    response.write_all(body.as_bytes())?;
                }
                Err(e) => {
                    log::warn!("OTA upload failed: {}", e);
                    let mut response = req.into_status_response(e.http_status())?;
                    response.write_all(e.to_string().as_bytes())?;
                }
            }
            Ok::<(), anyhow::Error>(())
        })?;

        let link = self.endpoint.link().clone();
        let running = self.running_label.clone();
        server.fn_handler(STATUS_PATH, Method::Get, move |req| {
            let report = StatusReport {
                version: crate::version::DISPLAY_VERSION,
                running: &running,
                transfer: link.snapshot(),
            };
            let json = serde_json::to_string(&report)?;
            let mut response =
                req.into_response(200, Some("OK"), &[("Content-Type", "application/json")])?;
            response.write_all(json.as_bytes())?;
            Ok::<(), anyhow::Error>(())
        })?;

        Ok(server)
    }
}

impl TransferService for HttpTransferService {
    type Error = anyhow::Error;

    fn start(&mut self) -> Result<()> {
        self.poll();
        if self.retiring.is_some() {
            bail!("previous upload is still closing");
        }
        if self.server.is_none() {
            self.server = Some(self.build_server()?);
            log::info!("Transfer server listening on {}", UPLOAD_PATH);
        }
        self.endpoint.link().arm();
        Ok(())
    }

    fn is_listening(&self) -> bool {
        self.server.is_some() && self.endpoint.link().is_accepting()
    }

    fn phase(&self) -> TransferPhase {
        self.endpoint.link().phase()
    }

    fn stop(&mut self) {
        self.endpoint.link().disarm();
        let Some(server) = self.server.take() else {
            return;
        };
        if self.endpoint.link().session_active() {
            log::info!("Transfer server closing after the running upload");
            self.retiring = Some(server);
        } else {
            drop(server);
            log::info!("Transfer server stopped");
        }
    }

    fn poll(&mut self) {
        if self.retiring.is_some() && !self.endpoint.link().session_active() {
            self.retiring = None;
            log::info!("Transfer server stopped");
        }
    }
}
