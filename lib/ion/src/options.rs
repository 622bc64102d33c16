use serde_derive::Deserialize;

/// Fabric mode for a session: connection-oriented message endpoints or a
/// shared reliable-datagram endpoint multiplexed by stream id.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Msg,
    Rdm,
}

/// Completion-wait strategy used by the event loop when no progress is
/// available.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompMethod {
    Spin,
    Sread,
    WaitFd,
}

/// Endpoint and channel configuration. All fields have defaults so partial
/// TOML documents load cleanly.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Bind address for passive endpoints, local source for active ones.
    pub src_addr: Option<String>,
    pub src_port: u16,
    /// Target for connect / channel creation.
    pub dst_addr: Option<String>,
    pub dst_port: u16,
    /// Total bytes per ring, split across `no_buffers` slots. Capped at the
    /// provider's maximum message size at session setup.
    pub buf_size: usize,
    /// Number of slots in each ring.
    pub no_buffers: usize,
    pub provider: ProviderKind,
    pub comp_method: CompMethod,
    /// Back-pressure high / low water marks on outstanding outbound bytes.
    pub hwm_bytes: u64,
    pub lwm_bytes: u64,
    /// Minimum number of above-threshold enqueues before the buffer-full
    /// callback fires.
    pub hwm_enqueue_count: u32,
    /// Largest accepted incoming packet body. Zero means no limit.
    pub max_packet_size: u32,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            src_addr: None,
            src_port: 0,
            dst_addr: None,
            dst_port: 0,
            buf_size: 64 * 1024,
            no_buffers: 4,
            provider: ProviderKind::Msg,
            comp_method: CompMethod::Spin,
            hwm_bytes: 100 * 1024 * 1024,
            lwm_bytes: 50 * 1024 * 1024,
            hwm_enqueue_count: 1024 * 1024,
            max_packet_size: 1024 * 1024,
        }
    }
}

impl Options {
    /// Loads options from a TOML document, filling omitted fields with
    /// defaults.
    pub fn from_toml_str(toml: &str) -> Result<Options, serdeconv::Error> {
        serdeconv::from_toml_str(toml)
    }

    /// `addr:port` string for the local bind point.
    pub fn src_endpoint(&self) -> String {
        format!(
            "{}:{}",
            self.src_addr.as_deref().unwrap_or("0.0.0.0"),
            self.src_port
        )
    }

    /// `addr:port` string for the connect target.
    pub fn dst_endpoint(&self) -> String {
        format!(
            "{}:{}",
            self.dst_addr.as_deref().unwrap_or("127.0.0.1"),
            self.dst_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = Options::default();

        assert_eq!(opts.no_buffers, 4);
        assert_eq!(opts.buf_size, 64 * 1024);
        assert_eq!(opts.provider, ProviderKind::Msg);
        assert_eq!(opts.comp_method, CompMethod::Spin);
        assert_eq!(opts.hwm_bytes, 100 * 1024 * 1024);
        assert_eq!(opts.lwm_bytes, 50 * 1024 * 1024);
    }

    #[test]
    fn test_partial_toml() {
        let opts = Options::from_toml_str(
            r#"
dst_addr = "10.0.0.7"
dst_port = 9900
provider = "rdm"
comp_method = "wait_fd"
no_buffers = 8
"#,
        )
        .unwrap();

        assert_eq!(opts.dst_endpoint(), "10.0.0.7:9900");
        assert_eq!(opts.provider, ProviderKind::Rdm);
        assert_eq!(opts.comp_method, CompMethod::WaitFd);
        assert_eq!(opts.no_buffers, 8);
        // untouched fields keep their defaults
        assert_eq!(opts.buf_size, 64 * 1024);
    }

    #[test]
    fn test_endpoint_strings() {
        let mut opts = Options::default();
        opts.src_addr = Some("192.168.1.2".to_string());
        opts.src_port = 7001;

        assert_eq!(opts.src_endpoint(), "192.168.1.2:7001");
        assert_eq!(opts.dst_endpoint(), "127.0.0.1:0");
    }
}
