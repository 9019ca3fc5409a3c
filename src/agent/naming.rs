//! Names of the namespaces and interfaces created for model elements.

/// Kernel limit on interface names (IFNAMSIZ without the terminator).
pub const IF_NAME_MAX_LEN: usize = 15;

const MAX_HASH_LEN: usize = 6;

/// 32 letters, one per 5-bit group of the hash.
const LETTERS_5B: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyzABCDEF";

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

fn fnv1a_32(data: &[u8]) -> u32 {
    data.iter()
        .fold(FNV_OFFSET, |h, b| (h ^ u32::from(*b)).wrapping_mul(FNV_PRIME))
}

/// `len` characters of the FNV-1a hash of `s`, lowest bits last.
fn hash_string(s: &str, len: usize) -> String {
    let mut hn = fnv1a_32(s.as_bytes());
    let mut out = vec![0u8; len];
    for slot in out.iter_mut().rev() {
        *slot = LETTERS_5B[(hn & 0x1f) as usize];
        hn >>= 5;
    }
    out.into_iter().map(char::from).collect()
}

/// `prefix + label`, or `prefix` plus a short hash of the label when that
/// would not fit into an interface name.
///
/// Prefixes are internal constants and leave room for at least 3 hash chars.
pub fn gen_if_name(prefix: &str, logical_label: &str) -> String {
    if prefix.len() + logical_label.len() <= IF_NAME_MAX_LEN {
        return format!("{prefix}{logical_label}");
    }
    let hash_len = IF_NAME_MAX_LEN.saturating_sub(prefix.len()).min(MAX_HASH_LEN);
    format!("{prefix}{}", hash_string(logical_label, hash_len))
}

pub fn bond_if_name(ll: &str) -> String {
    gen_if_name("bond-", ll)
}

pub fn bridge_if_name(ll: &str) -> String {
    gen_if_name("br-", ll)
}

pub fn network_netns(ll: &str) -> String {
    format!("network-{ll}")
}

pub fn endpoint_netns(ll: &str) -> String {
    format!("endpoint-{ll}")
}

/// Veth item name with its two interface names: inside the namespace and
/// in the main namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethNames {
    pub veth: String,
    pub inner: String,
    pub outer: String,
}

impl VethNames {
    fn new(prefix: &str, ll: &str) -> Self {
        Self {
            veth: format!("{prefix}{ll}"),
            inner: gen_if_name(&format!("{prefix}in-"), ll),
            outer: gen_if_name(&format!("{prefix}out-"), ll),
        }
    }
}

/// Veth between a network namespace and its bridge.
pub fn network_bridge_veth(ll: &str) -> VethNames {
    VethNames::new("net-br-", ll)
}

/// Veth between a network namespace and the main-namespace router.
pub fn network_router_veth(ll: &str) -> VethNames {
    VethNames::new("net-rt-", ll)
}

pub fn endpoint_veth(ll: &str) -> VethNames {
    VethNames::new("ep-", ll)
}
