use std::sync::Arc;
use std::time::{Duration, Instant};

use tcflink_channel::{
    connect, ChannelConfig, CommandTable, MemoryServer, MEMORY_TRANSPORT,
};
use tcflink_frame::{Arg, ArgKind};
use tcflink_transport::{PeerAttributes, TransportRegistry, ATTR_TRANSPORT_NAME};
use tokio::time::timeout;

use crate::cmd::PongArgs;
use crate::exit::{channel_error, io_error, CliError, CliResult, SUCCESS, TIMEOUT, USAGE};
use crate::output::{print_pong, OutputFormat, PongRow};

pub fn run(args: PongArgs, format: OutputFormat) -> CliResult<i32> {
    let reply_timeout = parse_timeout(&args.timeout)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| io_error("runtime start failed", err))?;
    let rows = runtime.block_on(exchange(&args, reply_timeout))?;
    print_pong(&rows, format);
    Ok(SUCCESS)
}

/// The demo's server side: `Pong.echo` returns its arguments unchanged.
pub fn pong_protocol() -> CommandTable {
    let mut table = CommandTable::new();
    table.add_sync_command("Pong", "echo", vec![ArgKind::Json], |_, args| Ok(args));
    table
}

async fn exchange(args: &PongArgs, reply_timeout: Duration) -> CliResult<Vec<PongRow>> {
    let mut server = MemoryServer::new(Arc::new(pong_protocol()));
    if let Some(size) = args.chunk_size {
        server = server.with_chunk_size(size);
    }
    let mut registry = TransportRegistry::new();
    registry.register(Arc::new(server));

    let attrs = PeerAttributes::new().with(ATTR_TRANSPORT_NAME, MEMORY_TRANSPORT);
    let client = connect(&registry, &attrs, None, ChannelConfig::default())
        .map_err(|err| channel_error("connect failed", err))?;
    timeout(reply_timeout, client.wait_connected())
        .await
        .map_err(|_| CliError::new(TIMEOUT, "handshake timed out"))?
        .map_err(|err| channel_error("handshake failed", err))?;
    tracing::info!(
        channel = client.id(),
        peer_services = ?client.peer_services(),
        "connected to pong server"
    );

    let mut rows = Vec::with_capacity(args.count);
    for seq in 1..=args.count {
        let sent = format!("{} {seq}", args.message);
        let started = Instant::now();
        let reply = client.send_command("Pong", "echo", &[Arg::from(sent.as_str())], &[]);
        let result = timeout(reply_timeout, reply)
            .await
            .map_err(|_| CliError::new(TIMEOUT, format!("no reply to echo {seq}")))?
            .map_err(|err| channel_error("echo failed", err))?;
        let received = result
            .first()
            .and_then(Arg::as_str)
            .unwrap_or_default()
            .to_string();
        rows.push(PongRow {
            seq,
            sent,
            received,
            elapsed_us: started.elapsed().as_micros(),
        });
    }

    client.close();
    Ok(rows)
}

fn parse_timeout(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "timeout must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid timeout value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "timeout must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
