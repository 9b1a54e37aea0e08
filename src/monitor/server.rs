//! WebSocket server
//!
//! One cooperative task per client connection. Inbound client commands feed
//! the measurement flags and the observer map; outbound payloads arrive on
//! the connection's dispatch channel.

use std::sync::Arc;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use super::broker::UserConfigSink;
use super::buffer::MeasurementBuffer;
use super::message::{server_msg, ClientCommand, ClientMessage, UserConfig};
use super::registry::{ClientRegistry, ConnectionId};

/// Shared context handed to every connection task.
#[derive(Clone)]
pub struct ServerContext {
    pub registry: Arc<ClientRegistry>,
    pub buffer: Arc<MeasurementBuffer>,
    pub publisher: Arc<dyn UserConfigSink>,
}

/// Accept loop. Runs until the listener dies or the task is cancelled;
/// connection tasks are independent of it.
pub async fn run(listener: TcpListener, ctx: ServerContext) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "websocket server listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, ctx).await {
                tracing::debug!(%peer, error = %e, "connection closed with error");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, ctx: ServerContext) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut inbound) = ws.split();

    let (connection, mut outbound_rx) = ctx.registry.add_connection();
    tracing::debug!(%connection, "client connected");

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(payload) => {
                        if sink.send(Message::Text(payload)).await.is_err() {
                            // Failed send means the client is gone.
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = inbound.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_client_text(&text, connection, &ctx);
                        if sink.send(Message::Text(reply)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong/binary: nothing to do
                    Some(Err(e)) => {
                        tracing::debug!(%connection, error = %e, "websocket read error");
                        break;
                    }
                }
            }
        }
    }

    ctx.registry.unregister(connection);
    tracing::debug!(%connection, "client disconnected");
    Ok(())
}

/// Parse and apply one client message, returning the info ack to send back.
///
/// A malformed message only earns an error ack; it never closes the
/// connection.
fn handle_client_text(text: &str, connection: ConnectionId, ctx: &ServerContext) -> String {
    let parsed: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(%connection, error = %e, "unparseable client message");
            return server_msg::info("Mensaje no reconocido");
        }
    };

    match parsed {
        ClientMessage::Identify { user_id, rol } => {
            ctx.registry.register(&user_id, connection);
            tracing::info!(%connection, %user_id, %rol, "client identified");
            server_msg::info("Identificación registrada")
        }
        ClientMessage::Command(ClientCommand::Start {
            patient_id,
            doctor_id,
        }) => {
            ctx.buffer.set_active(patient_id, true);
            publish_config(ctx, UserConfig::new(patient_id, doctor_id, "start"));
            server_msg::info("Medición iniciada")
        }
        ClientMessage::Command(ClientCommand::Stop {
            patient_id,
            doctor_id,
        }) => {
            ctx.buffer.set_active(patient_id, false);
            publish_config(ctx, UserConfig::new(patient_id, doctor_id, "stop"));
            server_msg::info("Medición detenida")
        }
        ClientMessage::Command(ClientCommand::DoctorConfig {
            doctor_id,
            patient_id,
        }) => {
            ctx.registry.add_observer(patient_id, doctor_id);
            publish_config(
                ctx,
                UserConfig::new(patient_id, Some(doctor_id), "doctor_config")
                    .with_monitored(patient_id),
            );
            server_msg::info("Doctor configurado como observador")
        }
    }
}

fn publish_config(ctx: &ServerContext, config: UserConfig) {
    // The device mirror is best effort; a broker hiccup must not break the
    // client session.
    if let Err(e) = ctx.publisher.publish_user_config(&config) {
        tracing::warn!(error = %e, "user_config publish failed");
    }
}
