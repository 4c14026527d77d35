//! Tunnel address policy
//!
//! The accessory serial string is the only configuration channel the peer
//! has before the tunnel is up. Expected format: "address,dns_server".
//! Anything else falls back to the fixed legacy addressing so peers that do
//! not supply metadata keep working.

/// Fallback addressing for peers that send no token
const FALLBACK_ADDRESS: &str = "10.10.10.2";
const FALLBACK_DNS: &str = "8.8.8.8";
const FALLBACK_PREFIX: u8 = 30;

/// Prefix length used whenever the peer supplies explicit addressing
const TOKEN_PREFIX: u8 = 24;

/// Tunnel addressing for one session
///
/// Derived once per session from the accessory serial token; immutable
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressConfig {
    /// Local tunnel address
    pub address: String,
    /// DNS server handed to the resolver
    pub dns_server: String,
    /// Network prefix length
    pub prefix_len: u8,
}

/// Derive tunnel addressing from the accessory serial token
///
/// Total over its input: there is no error path, unusable tokens yield the
/// fallback addressing. Field validation happens at provisioning time.
pub fn derive(serial_token: &str) -> AddressConfig {
    let fields: Vec<&str> = serial_token.split(',').collect();

    if fields.len() == 2 {
        AddressConfig {
            address: fields[0].to_string(),
            dns_server: fields[1].to_string(),
            prefix_len: TOKEN_PREFIX,
        }
    } else {
        AddressConfig {
            address: FALLBACK_ADDRESS.to_string(),
            dns_server: FALLBACK_DNS.to_string(),
            prefix_len: FALLBACK_PREFIX,
        }
    }
}
