// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # TCP transport
//!
//! Length-delimited frames carrying bincode-encoded requests and responses.
//! A request opens its own connection, writes one frame and reads one
//! frame back.
//!

use crate::{
    codec,
    error::Error,
    identity::SiloAddress,
    message::{SiloRequest, SiloResponse},
    transport::{RequestHandler, Transport, unreachable},
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::{
    bytes::Bytes,
    codec::{Framed, LengthDelimitedCodec},
    sync::CancellationToken,
};
use tracing::{debug, warn};

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

#[derive(Debug, Serialize, Deserialize)]
struct RequestFrame {
    from: SiloAddress,
    target: SiloAddress,
    request: SiloRequest,
}

/// Transport over TCP.
#[derive(Clone, Default)]
pub struct TcpTransport {
    listeners: Arc<Mutex<HashMap<SiloAddress, CancellationToken>>>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn bind(
        &self,
        address: SiloAddress,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(), Error> {
        let listener = TcpListener::bind((address.host(), address.port()))
            .await
            .map_err(|e| {
                Error::Transport(format!("Can not bind {}: {}", address, e))
            })?;
        let token = CancellationToken::new();
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.clone(), token.clone());
        debug!("Listening for {} on {}.", address, address.endpoint());
        tokio::spawn(accept_loop(listener, address, handler, token));
        Ok(())
    }

    async fn unbind(&self, address: &SiloAddress) {
        let token = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address);
        if let Some(token) = token {
            token.cancel();
        }
    }

    async fn request(
        &self,
        from: &SiloAddress,
        target: &SiloAddress,
        request: SiloRequest,
        timeout: Duration,
    ) -> Result<SiloResponse, Error> {
        let frame = codec::encode(&RequestFrame {
            from: from.clone(),
            target: target.clone(),
            request,
        })?;
        let exchange = async {
            let stream = TcpStream::connect((target.host(), target.port()))
                .await
                .map_err(|e| unreachable(target, e))?;
            let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
            framed
                .send(Bytes::from(frame))
                .await
                .map_err(|e| unreachable(target, e))?;
            match framed.next().await {
                Some(Ok(bytes)) => codec::decode::<SiloResponse>(&bytes),
                Some(Err(e)) => Err(unreachable(target, e)),
                None => Err(unreachable(target, "connection closed")),
            }
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| Error::Timeout(timeout.as_millis() as u64))?
    }
}

async fn accept_loop(
    listener: TcpListener,
    bound: SiloAddress,
    handler: Arc<dyn RequestHandler>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(serve_connection(
                        stream,
                        bound.clone(),
                        handler.clone(),
                        token.clone(),
                    ));
                }
                Err(e) => warn!("Accept failed on {}: {}", bound, e),
            }
        }
    }
    debug!("Stopped listening for {}.", bound);
}

async fn serve_connection(
    stream: TcpStream,
    bound: SiloAddress,
    handler: Arc<dyn RequestHandler>,
    token: CancellationToken,
) {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    loop {
        let bytes = tokio::select! {
            _ = token.cancelled() => break,
            frame = framed.next() => match frame {
                Some(Ok(bytes)) => bytes,
                _ => break,
            }
        };
        let response = match codec::decode::<RequestFrame>(&bytes) {
            Ok(frame) if frame.target.designates(&bound) => {
                tokio::select! {
                    _ = token.cancelled() => break,
                    response = handler.handle(frame.from, frame.request) => response,
                }
            }
            Ok(frame) => SiloResponse::Failed(unreachable(
                &frame.target,
                format!("endpoint is bound to {}", bound),
            )),
            Err(e) => SiloResponse::Failed(e),
        };
        let Ok(bytes) = codec::encode(&response) else {
            break;
        };
        if framed.send(Bytes::from(bytes)).await.is_err() {
            break;
        }
    }
}
