//! Echo service — two services talking over an in-memory transport.
//!
//! The server runs on its own thread and answers every [`Ping`] with a
//! [`Pong`]. The client is driven frame by frame from `main`, sends a ping
//! every few frames and stops once enough pongs have come back.
//!
//! Set `FRAMEKIT_FPS` to change the frame rate of both services.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use framekit_core::EventId;
use framekit_net::{LoopbackHub, Opcode};
use framekit_service::{Component, HookResult, HookStatus, Service, ServiceConfig, ServiceContext};

const SERVER_ADDR: &str = "loopback:echo";

const PING: Opcode = 1;
const PONG: Opcode = 2;

/// Fired on the server bus for every ping answered.
const PING_ANSWERED: EventId = 100;

const PINGS_TO_SEND: u32 = 5;
const FRAMES_BETWEEN_PINGS: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ping {
    seq: u32,
    note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Pong {
    seq: u32,
}

/// Answers pings on [`SERVER_ADDR`].
struct Echo;

impl Component for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn on_init(&mut self, ctx: &mut ServiceContext<'_>) -> HookResult {
        ctx.register_coder_for::<Ping>(PING)?;
        ctx.register_coder_for::<Pong>(PONG)?;

        ctx.subscribe(PING, |packet, dispatch| {
            let Some(ping) = packet.decoded::<Ping>() else {
                return;
            };
            if let Err(err) = dispatch.send(packet.session_id, PONG, &Pong { seq: ping.seq }) {
                warn!(error = %err, "failed to answer ping");
                return;
            }
            let mut event = dispatch.acquire_event(PING_ANSWERED);
            event.add_param(ping.seq).add_named_param("note", ping.note.clone());
            dispatch.fire(event);
        })?;

        ctx.add_listener(PING_ANSWERED, |event| {
            info!(seq = ?event.param(0), note = ?event.named_param("note"), "ping answered");
        });
        Ok(HookStatus::Done)
    }

    fn on_start(&mut self, ctx: &mut ServiceContext<'_>) -> HookResult {
        ctx.listen(SERVER_ADDR)?;
        Ok(HookStatus::Done)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("echo_service=info".parse()?))
        .init();

    let hub = LoopbackHub::new();

    let mut server = Service::with_transport(ServiceConfig::from_env("echo-server"), hub.transport_factory())?;
    server.add_component(Echo)?;
    let server = server.spawn().context("failed to spawn echo server")?;
    info!(service = server.name(), addr = SERVER_ADDR, "server running");

    let mut client = Service::with_transport(ServiceConfig::from_env("echo-client"), hub.transport_factory())?;
    client.register_coder_for::<Ping>(PING)?;
    client.register_coder_for::<Pong>(PONG)?;

    let pongs = Arc::new(AtomicU32::new(0));
    let received = Arc::clone(&pongs);
    client.subscribe(PONG, move |packet, _| {
        if let Some(pong) = packet.decoded::<Pong>() {
            info!(seq = pong.seq, "pong received");
            received.fetch_add(1, Ordering::SeqCst);
        }
    })?;
    client.start()?;

    let session = client.connect(SERVER_ADDR)?;
    let started = Instant::now();
    let mut sent = 0;

    while pongs.load(Ordering::SeqCst) < PINGS_TO_SEND {
        let frame_start = Instant::now();
        if !client.main_loop() {
            bail!("client stopped unexpectedly");
        }

        if sent < PINGS_TO_SEND && client.frame_count() % FRAMES_BETWEEN_PINGS == 0 {
            sent += 1;
            client.send(
                session,
                PING,
                &Ping {
                    seq: sent,
                    note: format!("ping #{sent}"),
                },
            )?;
        }

        let budget = client.frame_interval();
        let elapsed = frame_start.elapsed();
        if elapsed < budget {
            thread::sleep(budget - elapsed);
        }
    }

    info!(
        pongs = pongs.load(Ordering::SeqCst),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "all pings answered"
    );

    client.stop();
    server.stop();
    let server = server.join()?;
    info!(service = server.name(), state = ?server.state(), "server finished");

    Ok(())
}
