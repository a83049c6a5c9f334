//! Transport identifiers and the transport registry. A transport id names
//! an NVMe endpoint: transport type, address, service id and subsystem NQN.
//! Transports register explicitly at startup; the `custom` type exists so
//! out-of-tree transports (software endpoints among them) can plug into the
//! same probe and connect paths.

use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};

use nix::errno::Errno;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::{
    bdev::nvmx::{
        controller::NvmeControllerOpts,
        protocol::{NvmeCompletion, DISCOVERY_NQN},
        qpair::NvmeRequest,
    },
    core::CoreError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransportType {
    Pcie,
    Rdma,
    Tcp,
    VfioUser,
    Custom,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportType::Pcie => "PCIe",
            TransportType::Rdma => "RDMA",
            TransportType::Tcp => "TCP",
            TransportType::VfioUser => "VFIOUSER",
            TransportType::Custom => "CUSTOM",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for TransportType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pcie" => Ok(TransportType::Pcie),
            "rdma" => Ok(TransportType::Rdma),
            "tcp" => Ok(TransportType::Tcp),
            "vfiouser" => Ok(TransportType::VfioUser),
            "custom" => Ok(TransportType::Custom),
            other => Err(format!("unknown transport type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
    Ib,
    Fc,
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AddressFamily::Ipv4 => "IPv4",
            AddressFamily::Ipv6 => "IPv6",
            AddressFamily::Ib => "IB",
            AddressFamily::Fc => "FC",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for AddressFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ipv4" => Ok(AddressFamily::Ipv4),
            "ipv6" => Ok(AddressFamily::Ipv6),
            "ib" => Ok(AddressFamily::Ib),
            "fc" => Ok(AddressFamily::Fc),
            other => Err(format!("unknown address family '{}'", other)),
        }
    }
}

/// Parsed transport identifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NvmeTransportId {
    pub trtype: TransportType,
    pub adrfam: Option<AddressFamily>,
    pub traddr: String,
    pub trsvcid: String,
    pub subnqn: String,
    /// alternative address used for failover
    pub alt_traddr: Option<String>,
    /// namespace to use, when the caller wants a specific one
    pub nsid: Option<u32>,
}

impl NvmeTransportId {
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// true when this id addresses a discovery controller
    pub fn is_discovery(&self) -> bool {
        self.subnqn == DISCOVERY_NQN
    }

    /// swap the primary and the failover address
    pub fn swap_alt_traddr(&mut self) -> bool {
        match self.alt_traddr.take() {
            Some(alt) => {
                self.alt_traddr =
                    Some(std::mem::replace(&mut self.traddr, alt));
                true
            }
            None => false,
        }
    }
}

impl fmt::Display for NvmeTransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trtype:{}", self.trtype)?;
        if let Some(adrfam) = self.adrfam {
            write!(f, " adrfam:{}", adrfam)?;
        }
        write!(f, " traddr:{}", self.traddr)?;
        if !self.trsvcid.is_empty() {
            write!(f, " trsvcid:{}", self.trsvcid)?;
        }
        write!(f, " subnqn:{}", self.subnqn)?;
        if let Some(ref alt) = self.alt_traddr {
            write!(f, " alt_traddr:{}", alt)?;
        }
        if let Some(nsid) = self.nsid {
            write!(f, " ns:{}", nsid)?;
        }
        Ok(())
    }
}

impl FromStr for NvmeTransportId {
    type Err = CoreError;

    /// Parse the token form `trtype:TCP adrfam:IPv4 traddr:10.0.0.1
    /// trsvcid:4420 subnqn:nqn...`; keys are case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| CoreError::InvalidTransportId {
            trid: s.to_string(),
            reason: reason.to_string(),
        };

        let mut trtype = None;
        let mut adrfam = None;
        let mut traddr = None;
        let mut trsvcid = String::new();
        let mut subnqn = None;
        let mut alt_traddr = None;
        let mut nsid = None;

        for token in s.split_whitespace() {
            let mut kv = token.splitn(2, ':');
            let key = kv
                .next()
                .ok_or_else(|| invalid("empty token"))?
                .to_lowercase();
            let value = kv
                .next()
                .ok_or_else(|| invalid("token without value"))?;

            match key.as_str() {
                "trtype" => {
                    trtype = Some(
                        TransportType::from_str(value)
                            .map_err(|e| invalid(&e))?,
                    )
                }
                "adrfam" => {
                    adrfam = Some(
                        AddressFamily::from_str(value)
                            .map_err(|e| invalid(&e))?,
                    )
                }
                "traddr" => traddr = Some(value.to_string()),
                "trsvcid" => trsvcid = value.to_string(),
                "subnqn" => subnqn = Some(value.to_string()),
                "alt_traddr" => alt_traddr = Some(value.to_string()),
                "ns" => {
                    nsid = Some(
                        value
                            .parse::<u32>()
                            .map_err(|_| invalid("ns is not a number"))?,
                    )
                }
                other => {
                    return Err(invalid(&format!("unknown key '{}'", other)))
                }
            }
        }

        let trtype = trtype.ok_or_else(|| invalid("trtype missing"))?;
        let traddr = match traddr {
            Some(traddr) => traddr,
            // a bare PCIe id enumerates the whole bus
            None if trtype == TransportType::Pcie => String::new(),
            None => return Err(invalid("traddr missing")),
        };

        Ok(NvmeTransportId {
            trtype,
            adrfam,
            traddr,
            trsvcid,
            subnqn: subnqn.unwrap_or_else(|| DISCOVERY_NQN.to_string()),
            alt_traddr,
            nsid,
        })
    }
}

#[derive(Default, Debug)]
pub struct Builder {
    trtype: Option<TransportType>,
    adrfam: Option<AddressFamily>,
    svcid: String,
    traddr: String,
    subnqn: String,
    alt_traddr: Option<String>,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            ..Default::default()
        }
    }

    pub fn with_trtype(mut self, trtype: TransportType) -> Self {
        self.trtype = Some(trtype);
        self
    }

    pub fn with_adrfam(mut self, adrfam: AddressFamily) -> Self {
        self.adrfam = Some(adrfam);
        self
    }

    /// the address to connect to
    pub fn with_traddr(mut self, traddr: &str) -> Self {
        self.traddr = traddr.to_string();
        self
    }

    /// svcid (port) to connect to
    pub fn with_svcid(mut self, svcid: &str) -> Self {
        self.svcid = svcid.to_string();
        self
    }

    /// target nqn
    pub fn with_subnqn(mut self, subnqn: &str) -> Self {
        self.subnqn = subnqn.to_string();
        self
    }

    /// failover address
    pub fn with_alt_traddr(mut self, traddr: &str) -> Self {
        self.alt_traddr = Some(traddr.to_string());
        self
    }

    /// builder for a transport id; defaults to TCP and IPv4 when no
    /// transport type was given
    pub fn build(self) -> NvmeTransportId {
        let trtype = self.trtype.unwrap_or(TransportType::Tcp);
        let adrfam = self.adrfam.or(match trtype {
            TransportType::Tcp | TransportType::Rdma => {
                Some(AddressFamily::Ipv4)
            }
            _ => None,
        });
        NvmeTransportId {
            trtype,
            adrfam,
            traddr: self.traddr,
            trsvcid: self.svcid,
            subnqn: if self.subnqn.is_empty() {
                DISCOVERY_NQN.to_string()
            } else {
                self.subnqn
            },
            alt_traddr: self.alt_traddr,
            nsid: None,
        }
    }
}

/// Controller-level transport operations.
pub trait ControllerTransport: Send {
    /// build the rings for a qpair; qid 0 is the admin qpair
    fn alloc_qpair(
        &mut self,
        qid: u16,
        size: u32,
    ) -> Result<Box<dyn QpairTransport>, CoreError>;

    /// re-initialize the controller after a transport failure; admin qpair
    /// state is rebuilt by the caller afterwards
    fn reconnect(&mut self) -> Result<(), Errno>;

    /// hot-removal observed at the transport level
    fn is_removed(&self) -> bool {
        false
    }
}

/// Per-qpair transport operations: a submission/completion ring pair.
pub trait QpairTransport: Send {
    fn qid(&self) -> u16;

    fn connect(&mut self) -> Result<(), Errno>;

    fn disconnect(&mut self);

    /// Enqueue the request. ENOMEM means the ring is full, ENXIO that the
    /// transport has failed.
    fn submit(&mut self, req: &mut NvmeRequest) -> Result<(), Errno>;

    /// Reap up to `max` completions (0 means all). ENXIO signals transport
    /// failure and makes the caller run the reconnect protocol.
    fn process_completions(
        &mut self,
        max: u32,
        out: &mut Vec<NvmeCompletion>,
    ) -> Result<u32, Errno>;
}

/// A transport: enumerates endpoints and connects controllers.
pub trait NvmeTransport: Send + Sync {
    fn trtype(&self) -> TransportType;

    /// candidates reachable through this transport that match the given id;
    /// bus enumeration for PCIe, a discovery service login for fabrics
    fn enumerate(
        &self,
        trid: &NvmeTransportId,
    ) -> Result<Vec<NvmeTransportId>, CoreError>;

    fn connect(
        &self,
        trid: &NvmeTransportId,
        opts: &NvmeControllerOpts,
    ) -> Result<Box<dyn ControllerTransport>, CoreError>;
}

static TRANSPORTS: Lazy<Mutex<HashMap<TransportType, Arc<dyn NvmeTransport>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Register a transport; the last registration for a type wins, which lets
/// tests shadow a built-in transport.
pub fn register_transport(transport: Arc<dyn NvmeTransport>) {
    let trtype = transport.trtype();
    info!("registered NVMe transport {}", trtype);
    TRANSPORTS.lock().insert(trtype, transport);
}

pub fn lookup_transport(
    trtype: TransportType,
) -> Result<Arc<dyn NvmeTransport>, CoreError> {
    TRANSPORTS.lock().get(&trtype).cloned().ok_or_else(|| {
        CoreError::TransportNotFound {
            trtype: trtype.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trid_parse_format_roundtrip() {
        let s = "trtype:TCP adrfam:IPv4 traddr:127.0.0.1 trsvcid:4420 \
                 subnqn:nqn.2019-05.io.iocore:test alt_traddr:127.0.0.2";
        let trid: NvmeTransportId = s.parse().unwrap();
        assert_eq!(trid.trtype, TransportType::Tcp);
        assert_eq!(trid.traddr, "127.0.0.1");
        assert_eq!(trid.alt_traddr.as_deref(), Some("127.0.0.2"));

        let formatted = trid.to_string();
        let reparsed: NvmeTransportId = formatted.parse().unwrap();
        assert_eq!(trid, reparsed);
    }

    #[test]
    fn trid_keys_are_case_insensitive() {
        let trid: NvmeTransportId =
            "TRTYPE:pcie TRADDR:0000:01:00.0".parse().unwrap();
        assert_eq!(trid.trtype, TransportType::Pcie);
        assert_eq!(trid.subnqn, DISCOVERY_NQN);
        assert!(trid.is_discovery());
    }

    #[test]
    fn trid_rejects_unknown_keys() {
        assert!("trtype:tcp traddr:1.2.3.4 color:red"
            .parse::<NvmeTransportId>()
            .is_err());
        assert!("traddr:1.2.3.4".parse::<NvmeTransportId>().is_err());
    }

    #[test]
    fn trid_failover_swap() {
        let mut trid: NvmeTransportId =
            "trtype:tcp traddr:10.0.0.1 alt_traddr:10.0.0.2"
                .parse()
                .unwrap();
        assert!(trid.swap_alt_traddr());
        assert_eq!(trid.traddr, "10.0.0.2");
        assert_eq!(trid.alt_traddr.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn builder_defaults() {
        let trid = NvmeTransportId::builder()
            .with_traddr("127.0.0.1")
            .with_svcid("4420")
            .build();
        assert_eq!(trid.trtype, TransportType::Tcp);
        assert_eq!(trid.subnqn, DISCOVERY_NQN);
    }
}
