//! Two channels over the in-memory transport: a `Pong` server and a client
//! that calls `Pong.echo` and listens for a `Pong.tick` event.
//!
//! `cargo run -p tcflink --example pong-server`

use std::sync::Arc;

use tcflink::channel::{connect, ChannelConfig, CommandTable, MemoryServer, MEMORY_TRANSPORT};
use tcflink::frame::{Arg, ArgKind};
use tcflink::transport::{PeerAttributes, TransportRegistry, ATTR_TRANSPORT_NAME};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::level_filters::LevelFilter::DEBUG)
        .with_target(false)
        .init();

    let mut table = CommandTable::new();
    table.add_command("Pong", "echo", vec![ArgKind::Json], |channel, args| async move {
        channel
            .send_event("Pong", "tick", &[Arg::from("echoed")])
            .map_err(|err| tcflink::channel::CommandError::Failed(err.to_string()))?;
        Ok(args)
    });

    let mut registry = TransportRegistry::new();
    registry.register(Arc::new(MemoryServer::new(Arc::new(table))));

    let attrs = PeerAttributes::new().with(ATTR_TRANSPORT_NAME, MEMORY_TRANSPORT);
    let client = connect(&registry, &attrs, None, ChannelConfig::default())?;
    client.wait_connected().await?;
    println!("connected, peer offers {:?}", client.peer_services());

    let (tick_tx, mut tick_rx) = tokio::sync::mpsc::unbounded_channel();
    client.add_event_handler("Pong", "tick", Vec::new(), move |args| {
        let _ = tick_tx.send(args);
    })?;

    let reply = client
        .send_command("Pong", "echo", &[Arg::from("ok")], &[])
        .await?;
    println!("echo replied {reply:?}");
    if let Some(tick) = tick_rx.recv().await {
        println!("tick event {tick:?}");
    }

    client.close();
    Ok(())
}
