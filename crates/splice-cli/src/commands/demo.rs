//! Demo command - one intercepted HTTP exchange on a virtual network
//!
//! Two hosts share a [`MemoryNetwork`] whose tap runs the interception
//! pipeline. The client fetches a page from the origin; both ends are plain
//! synthetic TCP stacks and never learn that the flow was split in two.
//! The interceptor's own interface is attached too and registered as local,
//! so only traffic between the two hosts is spliced.

use anyhow::{anyhow, bail, Context, Result};
use clap::Args;
use crossbeam_channel::{bounded, RecvTimeoutError};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use splice_core::config::{Config, Profile, RuleConfig, RuleScope};
use splice_core::frame::MacAddress;
use splice_core::pipeline::{FrameSink, StatsSnapshot};
use splice_core::stream::MessageReader;
use splice_core::tcp::SocketConfig;
use splice_core::{
    ConfiguredInterceptor, NetworkStream, Pipeline, SocketStream, TcpIpStack, TcpState,
    TcpStreamModifier, TrafficHandler,
};
use splice_platform::{
    register_local_addresses, Interface, MemoryInterface, MemoryNetwork, NetworkStats,
};
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const CLIENT_MAC: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0x01]);
const SERVER_MAC: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0x02]);
const PROXY: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 254);
const PROXY_MAC: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0xfe]);
const CLIENT_PORT: u16 = 49152;
const HOST_TICK: Duration = Duration::from_millis(50);

/// Demo command arguments
#[derive(Args, Debug)]
pub struct DemoArgs {
    /// Profile to intercept with, ignored when --config is given
    #[arg(short, long, default_value = "plaintext")]
    pub profile: String,

    /// Path the client requests
    #[arg(long, default_value = "/")]
    pub path: String,

    /// Body the origin serves
    #[arg(long, default_value = "Greetings from the origin server")]
    pub body: String,

    /// Extra replacement applied to the exchange, as FIND=REPLACE
    #[arg(short, long = "replace", value_name = "FIND=REPLACE")]
    pub replace: Vec<String>,

    /// Seconds to wait for the exchange to finish
    #[arg(long, default_value_t = 10)]
    pub timeout: u64,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

/// What each end saw
#[derive(Debug, Serialize)]
pub struct DemoReport {
    /// Profile in effect
    pub profile: String,
    /// Request head as the origin received it
    pub origin_request: String,
    /// Response head as the client received it
    pub client_response: String,
    /// Response body as the client received it, decoded
    pub client_body: String,
    /// Pipeline counters
    pub pipeline: PipelineCounters,
    /// Network counters
    pub network: NetworkCounters,
    /// Addresses the interceptor treats as its own
    pub local_addresses: Vec<Ipv4Addr>,
}

/// Serializable pipeline counters
#[derive(Debug, Serialize)]
pub struct PipelineCounters {
    frames_in: u64,
    frames_out: u64,
    frames_consumed: u64,
    stacks_created: u64,
    stacks_destroyed: u64,
}

impl From<StatsSnapshot> for PipelineCounters {
    fn from(s: StatsSnapshot) -> Self {
        Self {
            frames_in: s.frames_in,
            frames_out: s.frames_out,
            frames_consumed: s.frames_consumed,
            stacks_created: s.stacks_created,
            stacks_destroyed: s.stacks_destroyed,
        }
    }
}

/// Serializable network counters
#[derive(Debug, Serialize)]
pub struct NetworkCounters {
    transmitted: u64,
    tapped: u64,
    delivered: u64,
    dropped: u64,
}

impl From<NetworkStats> for NetworkCounters {
    fn from(s: NetworkStats) -> Self {
        Self {
            transmitted: s.transmitted,
            tapped: s.tapped,
            delivered: s.delivered,
            dropped: s.dropped,
        }
    }
}

/// Execute demo command
pub fn execute(args: DemoArgs, loaded: Option<Config>) -> Result<()> {
    let config = build_config(&args, loaded)?;
    let report = run(&config, &args)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Profile: {}", report.profile);
    println!();
    println!("--- origin received ---");
    println!("{}", report.origin_request.trim_end());
    println!();
    println!("--- client received ---");
    println!("{}", report.client_response.trim_end());
    println!();
    println!("{}", report.client_body);
    println!();
    println!(
        "Pipeline: {} in, {} out, {} consumed, {} stack(s) created, {} destroyed",
        report.pipeline.frames_in,
        report.pipeline.frames_out,
        report.pipeline.frames_consumed,
        report.pipeline.stacks_created,
        report.pipeline.stacks_destroyed,
    );
    println!(
        "Network: {} transmitted, {} tapped, {} delivered, {} dropped",
        report.network.transmitted,
        report.network.tapped,
        report.network.delivered,
        report.network.dropped,
    );
    Ok(())
}

/// Profile or file, plus the `--replace` rules
pub fn build_config(args: &DemoArgs, loaded: Option<Config>) -> Result<Config> {
    let mut config = match loaded {
        Some(config) => config,
        None => Config::from_profile(Profile::from_name(&args.profile)?),
    };
    for pair in &args.replace {
        config.replace.rules.push(parse_rule(pair, config.http.enabled)?);
    }
    config.validate().context("Invalid demo configuration")?;
    Ok(config)
}

/// Parse `FIND=REPLACE`
///
/// With HTTP parsing on the rule targets bodies, so lengths are fixed up.
pub fn parse_rule(pair: &str, http: bool) -> Result<RuleConfig> {
    let Some((find, replace)) = pair.split_once('=') else {
        bail!("Replacement '{pair}' is not of the form FIND=REPLACE");
    };
    if find.is_empty() {
        bail!("Replacement '{pair}' has an empty pattern");
    }
    let mut rule = RuleConfig::text(find, replace);
    if http {
        rule.scope = RuleScope::HttpBody;
    }
    Ok(rule)
}

/// Synthetic host stack wired to its interface
fn host_stack(
    interface: &Arc<MemoryInterface>,
    local: SocketAddrV4,
    remote: SocketAddrV4,
    remote_mac: MacAddress,
    config: SocketConfig,
) -> Arc<TcpIpStack> {
    let link = Some((interface.mac(), remote_mac));
    let stack = Arc::new(TcpIpStack::with_link(local, remote, link, config));

    let outbound = interface.clone();
    stack.on_frame_encapsulated(move |frame| {
        if let Err(error) = outbound.send(frame) {
            debug!(%error, "Host frame not sent");
        }
    });
    let weak = Arc::downgrade(&stack);
    interface.on_receive(move |frame| {
        if let Some(stack) = weak.upgrade() {
            stack.push_up(&frame, true);
        }
    });
    stack
}

/// Wrap `body` in gzip when the client accepts it
fn encode_body(body: &[u8], gzip: bool) -> Result<Vec<u8>> {
    if !gzip {
        return Ok(body.to_vec());
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    Ok(encoder.finish()?)
}

/// Origin: read one request head, answer it, close
fn serve(stream: Arc<dyn NetworkStream>, body: &str) -> Result<String> {
    let mut reader = MessageReader::new(stream.clone());
    let mut head = String::new();
    loop {
        let line = reader.read_line(8192)?;
        let line = String::from_utf8_lossy(&line);
        head.push_str(&line);
        if line.trim_end().is_empty() {
            break;
        }
    }

    let gzip = head.lines().any(|line| {
        let line = line.to_ascii_lowercase();
        line.starts_with("accept-encoding:") && line.contains("gzip")
    });
    let payload = encode_body(body.as_bytes(), gzip)?;
    let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\
         Content-Length: {}\r\nConnection: close\r\n",
        payload.len()
    );
    if gzip {
        response.push_str("Content-Encoding: gzip\r\n");
    }
    response.push_str("\r\n");

    stream.write_all(response.as_bytes())?;
    stream.write_all(&payload)?;
    stream.shutdown_write()?;
    // Wait for the client's FIN
    reader.read_to_end()?;
    Ok(head)
}

/// Client: send one request, read until the origin closes
fn fetch(client: &Arc<TcpIpStack>, path: &str, timeout: Duration) -> Result<Vec<u8>> {
    client.connect(timeout)?;
    let stream: Arc<dyn NetworkStream> = Arc::new(SocketStream::new(client.clone()));
    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: {SERVER}\r\nUser-Agent: splice-demo\r\n\
         Accept-Encoding: gzip\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes())?;
    let response = MessageReader::new(stream.clone()).read_to_end()?;
    stream.shutdown_write()?;
    client.socket().wait_for(TcpState::is_closed, timeout)?;
    Ok(response.to_vec())
}

/// Split a response into head and decoded body
fn decode_response(raw: &[u8]) -> Result<(String, String)> {
    let Some(split) = raw.windows(4).position(|w| w == b"\r\n\r\n") else {
        bail!("Response has no header terminator ({} bytes received)", raw.len());
    };
    let head = String::from_utf8_lossy(&raw[..split + 4]).into_owned();
    let body = &raw[split + 4..];
    let gzip = head.lines().any(|line| {
        line.to_ascii_lowercase().starts_with("content-encoding:") && line.contains("gzip")
    });

    let body = if gzip {
        let mut decoded = String::new();
        GzDecoder::new(body)
            .read_to_string(&mut decoded)
            .context("Client received a corrupt gzip body")?;
        decoded
    } else {
        String::from_utf8_lossy(body).into_owned()
    };
    Ok((head, body))
}

/// Run the exchange and tear everything down
pub fn run(config: &Config, args: &DemoArgs) -> Result<DemoReport> {
    let timeout = Duration::from_secs(args.timeout);
    let server_port = config.interception.ports.first().copied().unwrap_or(80);
    let client_addr = SocketAddrV4::new(CLIENT, CLIENT_PORT);
    let server_addr = SocketAddrV4::new(SERVER, server_port);
    let socket_config = config.socket_config();

    let network = Arc::new(MemoryNetwork::new()?);
    let client_if = network.attach("client", CLIENT, CLIENT_MAC)?;
    let server_if = network.attach("server", SERVER, SERVER_MAC)?;
    // The interceptor's own interface; the two hosts above are remote to it
    let proxy_if = network.attach("splice0", PROXY, PROXY_MAC)?;

    let interceptor = ConfiguredInterceptor::from_config(config)?;
    let handler =
        Arc::new(TcpStreamModifier::with_options(interceptor, config.intercept_options()));
    register_local_addresses(&handler, [proxy_if.as_ref()]);
    let (destroyed_tx, destroyed_rx) = bounded(1);
    handler.on_stack_destroyed(move |stack| {
        info!(id = stack.id(), "Intercepted flow finished");
        let _ = destroyed_tx.try_send(stack.id());
    });

    let sink: Arc<dyn FrameSink> = network.clone();
    let handlers: Vec<Arc<dyn TrafficHandler>> = vec![handler.clone()];
    let pipeline = Arc::new(Pipeline::new(handlers, sink));
    pipeline.start()?;
    let tap = Arc::downgrade(&pipeline);
    network.set_tap(move |frame| match tap.upgrade() {
        Some(pipeline) => pipeline.push_traffic(frame),
        None => Ok(()),
    });

    let server =
        host_stack(&server_if, server_addr, client_addr, CLIENT_MAC, socket_config.clone());
    let client = host_stack(&client_if, client_addr, server_addr, SERVER_MAC, socket_config);

    let (stop_tx, stop_rx) = bounded::<()>(0);
    let ticker = thread::Builder::new().name("host-timers".to_string()).spawn({
        let stacks = [client.clone(), server.clone()];
        move || loop {
            match stop_rx.recv_timeout(HOST_TICK) {
                Err(RecvTimeoutError::Timeout) => {
                    let now = Instant::now();
                    for stack in &stacks {
                        stack.tick(now);
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    })?;

    server.listen()?;
    let origin = thread::Builder::new().name("origin".to_string()).spawn({
        let stream: Arc<dyn NetworkStream> = Arc::new(SocketStream::new(server.clone()));
        let body = args.body.clone();
        move || serve(stream, &body)
    })?;

    let exchange = fetch(&client, &args.path, timeout);

    let finished = destroyed_rx.recv_timeout(timeout).is_ok();
    if !finished || exchange.is_err() {
        warn!(finished, "Exchange failed, resetting both hosts");
        client.abort();
        server.abort();
    }

    let origin_request = origin
        .join()
        .unwrap_or_else(|_| Err(anyhow!("Origin thread panicked")));

    pipeline.stop();
    pipeline.cleanup();
    drop(stop_tx);
    if ticker.join().is_err() {
        warn!("Host timer thread panicked");
    }
    client.clear_listeners();
    server.clear_listeners();
    network.shutdown();

    let raw = exchange?;
    let origin_request = origin_request?;
    let (client_response, client_body) = decode_response(&raw)?;

    Ok(DemoReport {
        profile: config.profile.map_or_else(|| config.general.name.clone(), |p| p.to_string()),
        origin_request,
        client_response,
        client_body,
        pipeline: pipeline.stats().snapshot().into(),
        network: network.stats().into(),
        local_addresses: handler.local_addresses(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_args(profile: &str, replace: &[&str]) -> DemoArgs {
        DemoArgs {
            profile: profile.to_string(),
            path: "/index.html".to_string(),
            body: "hello origin".to_string(),
            replace: replace.iter().map(ToString::to_string).collect(),
            timeout: 10,
            json: false,
        }
    }

    #[test]
    fn test_parse_rule() {
        let rule = parse_rule("origin=splice", true).unwrap();
        assert_eq!(rule.find, "origin");
        assert_eq!(rule.replace, "splice");
        assert_eq!(rule.scope, RuleScope::HttpBody);

        assert_eq!(parse_rule("a=", false).unwrap().scope, RuleScope::Stream);
        assert!(parse_rule("missing", false).is_err());
        assert!(parse_rule("=x", false).is_err());
    }

    #[test]
    fn test_decode_response_gzip() {
        let body = encode_body(b"compressed text", true).unwrap();
        let mut raw = b"HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\n\r\n".to_vec();
        raw.extend_from_slice(&body);
        let (head, decoded) = decode_response(&raw).unwrap();
        assert!(head.starts_with("HTTP/1.1 200 OK"));
        assert_eq!(decoded, "compressed text");
        assert!(decode_response(b"HTTP/1.1 200 OK\r\n").is_err());
    }

    #[test]
    fn test_plaintext_exchange_rewrites_body() {
        let args = demo_args("plaintext", &["origin=splice"]);
        let config = build_config(&args, None).unwrap();
        let report = run(&config, &args).unwrap();

        assert!(report.origin_request.starts_with("GET /index.html HTTP/1.1"));
        assert!(!report.origin_request.to_ascii_lowercase().contains("accept-encoding"));
        assert_eq!(report.client_body, "hello splice");
        assert!(report.client_response.contains("Content-Length: 12"));
        assert_eq!(report.pipeline.stacks_created, 1);
        assert_eq!(report.pipeline.stacks_destroyed, 1);
        assert_eq!(report.local_addresses, vec![PROXY]);
    }

    #[test]
    fn test_passthrough_exchange_is_untouched() {
        let args = demo_args("passthrough", &[]);
        let config = build_config(&args, None).unwrap();
        let report = run(&config, &args).unwrap();

        assert!(report.origin_request.contains("Accept-Encoding: gzip"));
        assert!(report.client_response.contains("Content-Encoding: gzip"));
        assert_eq!(report.client_body, "hello origin");
        assert_eq!(report.pipeline.stacks_created, 1);
    }
}
