//! Capability-data: an opaque serialised value accompanied by the list of
//! references it carries. Generic over the reference type so the same shape
//! serves both kernel-side (`CapData<KRef>`) and endpoint-side
//! (`CapData<ERef>`) messages (§6 wire format).

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapData<R> {
    pub body: String,
    pub slots: Vec<R>,
}

impl<R> CapData<R> {
    pub fn new(body: impl Into<String>, slots: Vec<R>) -> Self {
        CapData { body: body.into(), slots }
    }

    pub fn empty(body: impl Into<String>) -> Self {
        CapData { body: body.into(), slots: Vec::new() }
    }

    pub fn map_slots<S>(self, f: impl FnMut(R) -> S) -> CapData<S> {
        CapData { body: self.body, slots: self.slots.into_iter().map(f).collect() }
    }

    pub fn try_map_slots<S, E>(
        self,
        f: impl FnMut(R) -> Result<S, E>,
    ) -> Result<CapData<S>, E> {
        let slots = self.slots.into_iter().map(f).collect::<Result<Vec<S>, E>>()?;
        Ok(CapData { body: self.body, slots })
    }
}

/// A method invocation's argument list and optional result promise.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message<R, P> {
    pub methargs: CapData<R>,
    pub result: Option<P>,
}

/// One settlement in a notify batch: the translated target, whether it is a
/// rejection, and the translated value (§4.4).
#[derive(Clone, Debug)]
pub struct OneResolution<R> {
    pub target: R,
    pub rejected: bool,
    pub value: CapData<R>,
}
