use http::Uri;

use crate::request::Proxy;

/// Grouping key for connection limits and pool buckets.
///
/// Derived from scheme, host, port, virtual host and proxy so that a
/// pooled channel is only ever reused for an exchange that would have
/// produced the same wire-level connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    scheme: String,
    host: String,
    port: u16,
    virtual_host: Option<String>,
    proxy: Option<String>,
}

impl PartitionKey {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}://{}:{}", self.scheme, self.host, self.port)?;
        if let Some(virtual_host) = &self.virtual_host {
            write!(formatter, " vhost={virtual_host}")?;
        }
        if let Some(proxy) = &self.proxy {
            write!(formatter, " proxy={proxy}")?;
        }
        Ok(())
    }
}

pub(crate) fn default_port(scheme: &str) -> u16 {
    match scheme {
        "https" | "wss" => 443,
        _ => 80,
    }
}

pub(crate) fn explicit_port(uri: &Uri) -> u16 {
    uri.port_u16()
        .unwrap_or_else(|| default_port(uri.scheme_str().unwrap_or("http")))
}

/// The pluggable `(uri, virtual host, proxy) -> PartitionKey` function.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Partitioning {
    /// One partition per target host (the default).
    #[default]
    PerHost,
    /// A single partition for every request; useful when the client
    /// only ever talks to one backend and per-host bookkeeping is
    /// overhead.
    Global,
}

impl Partitioning {
    pub fn partition_key(
        &self,
        uri: &Uri,
        virtual_host: Option<&str>,
        proxy: Option<&Proxy>,
    ) -> PartitionKey {
        match self {
            Self::Global => PartitionKey {
                scheme: String::new(),
                host: String::new(),
                port: 0,
                virtual_host: None,
                proxy: None,
            },
            Self::PerHost => PartitionKey {
                scheme: uri.scheme_str().unwrap_or("http").to_ascii_lowercase(),
                host: uri.host().unwrap_or_default().to_ascii_lowercase(),
                port: explicit_port(uri),
                virtual_host: virtual_host.map(|value| value.to_ascii_lowercase()),
                proxy: proxy.map(|proxy| format!("{}:{}", proxy.host(), proxy.port())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(text: &str) -> Uri {
        text.parse().expect("test uri")
    }

    #[test]
    fn per_host_keys_differ_by_authority() {
        let partitioning = Partitioning::PerHost;
        let a = partitioning.partition_key(&uri("http://a.example.com/x"), None, None);
        let b = partitioning.partition_key(&uri("http://b.example.com/x"), None, None);
        assert_ne!(a, b);

        let a_again = partitioning.partition_key(&uri("http://A.EXAMPLE.COM/other"), None, None);
        assert_eq!(a, a_again);
    }

    #[test]
    fn scheme_default_ports_are_applied() {
        let partitioning = Partitioning::PerHost;
        let implicit = partitioning.partition_key(&uri("https://example.com/"), None, None);
        let explicit = partitioning.partition_key(&uri("https://example.com:443/"), None, None);
        assert_eq!(implicit, explicit);
        assert_eq!(implicit.port(), 443);
    }

    #[test]
    fn global_partitioning_collapses_hosts() {
        let partitioning = Partitioning::Global;
        let a = partitioning.partition_key(&uri("http://a.example.com/"), None, None);
        let b = partitioning.partition_key(&uri("https://b.example.com/"), Some("v"), None);
        assert_eq!(a, b);
    }

    #[test]
    fn proxy_and_virtual_host_split_partitions() {
        let partitioning = Partitioning::PerHost;
        let plain = partitioning.partition_key(&uri("http://example.com/"), None, None);
        let proxied = partitioning.partition_key(
            &uri("http://example.com/"),
            None,
            Some(&Proxy::new("proxy.local", 3128)),
        );
        let virtual_hosted =
            partitioning.partition_key(&uri("http://example.com/"), Some("other"), None);
        assert_ne!(plain, proxied);
        assert_ne!(plain, virtual_hosted);
    }
}
