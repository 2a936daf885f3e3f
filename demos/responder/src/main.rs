//! Illustrative embedder: wires `mdns::Server` to the `runtime` poll loop
//! and publishes one `_http._tcp` service. The engine never opens a
//! socket itself; [`LoggingTransport`] only logs what it would have sent.

use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use log::{info, LevelFilter};
use stakker::{actor, call, ret_nop, ActorOwn, Core, Stakker, CX};

use mdns::dns_sd::ServiceParams;
use mdns::entry::Protocol;
use mdns::interface::Transport;
use mdns::{Config, Server};

struct LoggingTransport;

impl Transport for LoggingTransport {
	fn join_multicast(&mut self, interface: mdns::InterfaceIndex, protocol: Protocol) {
		info!("would join multicast on interface {interface} ({protocol:?})");
	}

	fn leave_multicast(&mut self, interface: mdns::InterfaceIndex, protocol: Protocol) {
		info!("would leave multicast on interface {interface} ({protocol:?})");
	}

	fn send(&mut self, interface: mdns::InterfaceIndex, protocol: Protocol, dest: IpAddr, port: u16, packet: &[u8]) {
		info!("would send {} bytes to {dest}:{port} via interface {interface} ({protocol:?})", packet.len());
	}
}

/// Ticks the engine's cache/scheduler timers on a fixed cadence and keeps
/// rescheduling itself; a production embedder would instead derive its
/// wakeup from [`mdns::Server::tick`]'s returned `Instant` via
/// [`mdns::PollApi`].
struct Responder {
	server: Server,
	transport: LoggingTransport,
}

impl Responder {
	fn init(_cx: CX![]) -> Option<Self> {
		let mut config = Config::default();
		config.host_name = Some("demo-responder".to_string());

		let mut server = Server::new(config);

		let group = server.entries.create_group();
		let host = wire::Name::parse("demo-responder.local").ok()?;
		let params = ServiceParams { instance: "Demo HTTP Server", service_type: "_http._tcp", domain: "local", host, port: 8080, txt: vec![b"path=/".to_vec()] };
		if let Err(err) = mdns::dns_sd::add_service(&mut server.entries, group, mdns::entry::IF_UNSPEC, None, params) {
			log::error!("failed to publish demo service: {err}");
		}
		server.commit_group(group, Instant::now());

		Some(Self { server, transport: LoggingTransport })
	}

	fn tick(&mut self, cx: CX![]) {
		let now = Instant::now();
		self.server.tick(now, &mut self.transport);
		cx.timer_add(now + Duration::from_millis(250), ret_nop!());
		call!([cx.this()], tick());
	}
}

fn main() {
	log::set_max_level(LevelFilter::Info);
	log::set_boxed_logger(Box::new(runtime::logger::Logger)).expect("logger should only be installed once");

	let mut stakker = runtime::init();
	let s: &mut Stakker = &mut stakker;

	let responder: ActorOwn<Responder> = actor!(s, Responder::init(), ret_nop!());
	call!([responder], tick());

	runtime::exec(&mut stakker, || info!("shutting down responder demo")).expect("runtime loop should not fail");
}
