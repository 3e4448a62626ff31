// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Health and stats HTTP server.
//!
//! `GET /healthcheck` returns the stats snapshot, `GET /debug/vars` the
//! published vars (`cmdline` and `stats`), and `GET /` an HTML index of both.
//! Everything else is a 404.

use std::env;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper::{header, http, Method, Response, StatusCode};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::errors::StartupError;
use crate::http_utils::{json_response, log_and_create_http_response};
use crate::stats::RelayStats;

pub const HEALTHCHECK_PATH: &str = "/healthcheck";
pub const DEBUG_VARS_PATH: &str = "/debug/vars";
pub const INDEX_PATH: &str = "/";

const INDEXED_PATHS: [&str; 2] = [DEBUG_VARS_PATH, HEALTHCHECK_PATH];

pub async fn bind(addr: SocketAddr) -> Result<TcpListener, StartupError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| StartupError::Bind { addr, source })
}

pub fn handle_request(
    method: &Method,
    path: &str,
    stats: &RelayStats,
) -> http::Result<Response<Full<Bytes>>> {
    let body = match (method, path) {
        (&Method::GET, HEALTHCHECK_PATH) => serde_json::to_string(&stats.snapshot()),
        (&Method::GET, DEBUG_VARS_PATH) => serde_json::to_string(&json!({
            "cmdline": env::args().collect::<Vec<_>>(),
            "stats": stats.snapshot(),
        })),
        (&Method::GET, INDEX_PATH) => return index_response(),
        _ => {
            return Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::default());
        }
    };
    match body {
        Ok(body) => json_response(body, StatusCode::OK),
        Err(e) => log_and_create_http_response(
            &format!("Error serializing stats: {e}"),
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
    }
}

fn index_response() -> http::Result<Response<Full<Bytes>>> {
    let rows: String = INDEXED_PATHS
        .iter()
        .map(|path| format!("<tr><td><a href=\"{path}?debug=1\">{path}</a></td></tr>\n"))
        .collect();
    let body = format!(
        "<html>\n<head>\n<title>Debug Index</title>\n</head>\n<body>\n<h2>Index</h2>\n\
         <table>\n{rows}</table>\n</body>\n</html>\n"
    );
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
}

/// Serves requests on `listener` until `cancel_token` fires.
pub async fn serve(
    listener: TcpListener,
    stats: Arc<RelayStats>,
    cancel_token: CancellationToken,
) -> io::Result<()> {
    let service = service_fn(move |req| {
        let stats = Arc::clone(&stats);
        async move { handle_request(req.method(), req.uri().path(), &stats) }
    });

    if let Ok(addr) = listener.local_addr() {
        debug!("Health server listening on {addr}");
    }

    let server = hyper::server::conn::http1::Builder::new();
    let mut joinset = tokio::task::JoinSet::new();

    loop {
        let conn = tokio::select! {
            () = cancel_token.cancelled() => break,
            con_res = listener.accept() => match con_res {
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    error!("Health server error: {e}");
                    return Err(e);
                }
                Ok((conn, _)) => conn,
            },
            finished = async {
                match joinset.join_next().await {
                    Some(finished) => finished,
                    None => std::future::pending().await,
                }
            } => match finished {
                Err(e) if e.is_panic() => {
                    error!("Connection handler panicked: {e:?}");
                    continue;
                }
                Ok(()) | Err(_) => continue,
            },
        };
        let conn = hyper_util::rt::TokioIo::new(conn);
        let server = server.clone();
        let service = service.clone();
        joinset.spawn(async move {
            if let Err(e) = server.serve_connection(conn, service).await {
                debug!("Health connection error: {e}");
            }
        });
    }

    joinset.abort_all();
    Ok(())
}
