//! String-tagged identifiers (§3). Every id is a content-free, monotonically
//! allocated counter rendered with a fixed prefix — never a UUID or random
//! value, so that replaying a crank log reproduces identical allocations.

use crate::error::KernelError;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

pub type Counter = u64;

macro_rules! counter_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
        #[serde(into = "String", try_from = "String")]
        pub struct $name(pub Counter);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl FromStr for $name {
            type Err = KernelError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.strip_prefix($prefix)
                    .and_then(|rest| rest.parse::<Counter>().ok())
                    .map($name)
                    .ok_or_else(|| KernelError::InvalidRef(s.to_string()))
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.to_string()
            }
        }

        impl TryFrom<String> for $name {
            type Error = KernelError;
            fn try_from(s: String) -> Result<Self, Self::Error> {
                s.parse()
            }
        }
    };
}

counter_id!(KOId, "ko");
counter_id!(KPId, "kp");
counter_id!(SubclusterId, "s");

/// A kernel-global reference: either an object or a promise.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum KRef {
    Object(KOId),
    Promise(KPId),
}

impl KRef {
    pub fn is_promise(&self) -> bool {
        matches!(self, KRef::Promise(_))
    }

    pub fn is_object(&self) -> bool {
        matches!(self, KRef::Object(_))
    }
}

impl fmt::Display for KRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KRef::Object(id) => write!(f, "{id}"),
            KRef::Promise(id) => write!(f, "{id}"),
        }
    }
}

impl FromStr for KRef {
    type Err = KernelError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with("ko") {
            s.parse::<KOId>().map(KRef::Object)
        } else if s.starts_with("kp") {
            s.parse::<KPId>().map(KRef::Promise)
        } else {
            Err(KernelError::InvalidRef(s.to_string()))
        }
    }
}

impl From<KRef> for String {
    fn from(k: KRef) -> String {
        k.to_string()
    }
}

impl TryFrom<String> for KRef {
    type Error = KernelError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<KOId> for KRef {
    fn from(id: KOId) -> Self {
        KRef::Object(id)
    }
}

impl From<KPId> for KRef {
    fn from(id: KPId) -> Self {
        KRef::Promise(id)
    }
}

/// A local sandbox (`v<n>`), a remote peer (`r<n>`), or the kernel-service
/// pseudo-endpoint (the literal `"kernel"`).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum EndpointId {
    Vat(Counter),
    Remote(Counter),
    Kernel,
}

impl EndpointId {
    pub fn is_remote(&self) -> bool {
        matches!(self, EndpointId::Remote(_))
    }

    pub fn is_kernel(&self) -> bool {
        matches!(self, EndpointId::Kernel)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointId::Vat(n) => write!(f, "v{n}"),
            EndpointId::Remote(n) => write!(f, "r{n}"),
            EndpointId::Kernel => write!(f, "kernel"),
        }
    }
}

impl FromStr for EndpointId {
    type Err = KernelError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "kernel" {
            Ok(EndpointId::Kernel)
        } else if let Some(rest) = s.strip_prefix('v') {
            rest.parse().map(EndpointId::Vat).map_err(|_| KernelError::InvalidRef(s.to_string()))
        } else if let Some(rest) = s.strip_prefix('r') {
            rest.parse().map(EndpointId::Remote).map_err(|_| KernelError::InvalidRef(s.to_string()))
        } else {
            Err(KernelError::InvalidRef(s.to_string()))
        }
    }
}

impl From<EndpointId> for String {
    fn from(e: EndpointId) -> String {
        e.to_string()
    }
}

impl TryFrom<String> for EndpointId {
    type Error = KernelError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Import vs. export, in the **endpoint's own** frame of reference. Remote
/// translation flips this (§3); local translation never does.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum Polarity {
    Import,
    Export,
}

impl Polarity {
    pub fn flip(self) -> Self {
        match self {
            Polarity::Import => Polarity::Export,
            Polarity::Export => Polarity::Import,
        }
    }

    fn sigil(self) -> char {
        match self {
            Polarity::Import => '-',
            Polarity::Export => '+',
        }
    }

    fn from_sigil(c: char) -> Result<Self, KernelError> {
        match c {
            '+' => Ok(Polarity::Export),
            '-' => Ok(Polarity::Import),
            _ => Err(KernelError::InvalidRef(c.to_string())),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum ERefKind {
    Object,
    Promise,
}

/// An endpoint-local reference, e.g. `o+7`, `p-3`, `ro+4`, `rp-1`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ERef {
    pub remote: bool,
    pub kind: ERefKind,
    pub polarity: Polarity,
    pub number: Counter,
}

impl ERef {
    pub fn local_object(polarity: Polarity, number: Counter) -> Self {
        ERef { remote: false, kind: ERefKind::Object, polarity, number }
    }

    pub fn local_promise(polarity: Polarity, number: Counter) -> Self {
        ERef { remote: false, kind: ERefKind::Promise, polarity, number }
    }

    pub fn with_polarity(self, polarity: Polarity) -> Self {
        ERef { polarity, ..self }
    }

    pub fn flipped(self) -> Self {
        self.with_polarity(self.polarity.flip())
    }

    pub fn matches_kref_kind(&self, kref: &KRef) -> bool {
        match (self.kind, kref) {
            (ERefKind::Object, KRef::Object(_)) => true,
            (ERefKind::Promise, KRef::Promise(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ERef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.remote {
            write!(f, "r")?;
        }
        let kind = match self.kind {
            ERefKind::Object => 'o',
            ERefKind::Promise => 'p',
        };
        write!(f, "{kind}{}{}", self.polarity.sigil(), self.number)
    }
}

impl FromStr for ERef {
    type Err = KernelError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (remote, rest) = match s.strip_prefix('r') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let mut chars = rest.chars();
        let kind = match chars.next() {
            Some('o') => ERefKind::Object,
            Some('p') => ERefKind::Promise,
            _ => return Err(KernelError::InvalidRef(s.to_string())),
        };
        let sigil = chars.next().ok_or_else(|| KernelError::InvalidRef(s.to_string()))?;
        let polarity = Polarity::from_sigil(sigil)?;
        let number: Counter = chars
            .as_str()
            .parse()
            .map_err(|_| KernelError::InvalidRef(s.to_string()))?;
        Ok(ERef { remote, kind, polarity, number })
    }
}

impl From<ERef> for String {
    fn from(e: ERef) -> String {
        e.to_string()
    }
}

impl TryFrom<String> for ERef {
    type Error = KernelError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}
