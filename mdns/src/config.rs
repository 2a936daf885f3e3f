/// Server-wide configuration. Defaults mirror the upstream Avahi daemon's
/// shipped defaults: both IP stacks on, response IP TTL checked, reflector
/// off.
#[derive(Clone, Debug)]
pub struct Config {
	pub use_ipv4: bool,
	pub use_ipv6: bool,
	pub publish_hinfo: bool,
	pub publish_addresses: bool,
	pub publish_workstation: bool,
	pub publish_domain: bool,
	pub check_response_ttl: bool,
	pub use_iff_running: bool,
	pub enable_reflector: bool,
	pub reflect_ipv: bool,
	pub add_service_cookie: bool,
	pub host_name: Option<String>,
	pub domain_name: String,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			use_ipv4: true,
			use_ipv6: true,
			publish_hinfo: true,
			publish_addresses: true,
			publish_workstation: false,
			publish_domain: false,
			check_response_ttl: true,
			use_iff_running: false,
			enable_reflector: false,
			reflect_ipv: false,
			add_service_cookie: false,
			host_name: None,
			domain_name: "local".to_string(),
		}
	}
}
