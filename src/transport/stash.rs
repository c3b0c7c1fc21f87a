// Pending-send stash.
//
// A refused send is never dropped: the message is parked here and retried
// on every loop iteration until the destination ring accepts it. The stash
// is unbounded by design; growth past the diagnostic threshold is logged
// and forward progress continues.

use crate::transport::{Adaptor, Bundle};
use tracing::{info, warn};

/// Stash size past which growth is reported.
const DIAG_THRESHOLD: usize = 64;

struct PendingSend {
    dst_sid: usize,
    dst_tid: usize,
    bundle: Bundle,
}

/// Park-and-retry buffer for refused sends.
#[derive(Default)]
pub struct SendStash {
    pending: Vec<PendingSend>,
}

impl SendStash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Try to send; on refusal park the message for later sweeps. Returns
    /// whether the transport accepted the send now.
    pub fn send_or_stash(
        &mut self,
        adaptor: &Adaptor,
        dst_sid: usize,
        dst_tid: usize,
        bundle: Bundle,
    ) -> bool {
        if adaptor.send(dst_sid, dst_tid, &bundle) {
            return true;
        }
        self.pending.push(PendingSend {
            dst_sid,
            dst_tid,
            bundle,
        });
        if self.pending.len() == DIAG_THRESHOLD {
            warn!(
                sid = adaptor.sid(),
                tid = adaptor.tid(),
                "send stash reached {} pending messages",
                DIAG_THRESHOLD
            );
        }
        false
    }

    /// Retry every parked message, keeping those still refused.
    pub fn sweep(&mut self, adaptor: &Adaptor) {
        if self.pending.is_empty() {
            return;
        }
        info!(
            sid = adaptor.sid(),
            tid = adaptor.tid(),
            "{} pending msgs on worker",
            self.pending.len()
        );
        self.pending
            .retain(|msg| !adaptor.send(msg.dst_sid, msg.dst_tid, &msg.bundle));
    }
}
