use parking_lot::Mutex;

/// The pair fixed by the first packetized block of an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NptZero {
    /// Clock time at which normal play time 0 is released to the network.
    pub npt_zero: i64,
    /// Added to every pts before RTP timestamp conversion.
    pub pts_offset: i64,
}

/// Normal-play-time origin shared by every RTP session of one output.
///
/// Each session's RTP timestamp offset is derived from the same pair, so
/// receivers can align streams without waiting for RTCP. The pair is set
/// once by whichever session sends first.
#[derive(Debug)]
pub struct NptReference {
    pts_zero: i64,
    zero: Mutex<Option<NptZero>>,
}

impl NptReference {
    /// A reference with a random `pts_zero` (RFC 3550 §5.1 wants the initial
    /// timestamp unpredictable).
    pub fn new() -> Self {
        Self::with_pts_zero(i64::from(rand::random::<u32>()))
    }

    pub fn with_pts_zero(pts_zero: i64) -> Self {
        Self {
            pts_zero,
            zero: Mutex::new(None),
        }
    }

    pub fn pts_zero(&self) -> i64 {
        self.pts_zero
    }

    /// Fix the pair from the first observed `pts` if it is not set yet, and
    /// return the pair in effect.
    pub fn observe(&self, pts: i64, caching: i64) -> NptZero {
        *self.zero.lock().get_or_insert_with(|| {
            tracing::debug!(pts, caching, "NPT zero fixed");
            NptZero {
                npt_zero: pts + caching,
                pts_offset: self.pts_zero - pts,
            }
        })
    }

    pub fn get(&self) -> Option<NptZero> {
        *self.zero.lock()
    }

    /// Normal play time at clock time `now`, never negative. `None` until
    /// the first block.
    pub fn npt(&self, now: i64) -> Option<i64> {
        self.get().map(|zero| (now - zero.npt_zero).max(0))
    }
}

impl Default for NptReference {
    fn default() -> Self {
        Self::new()
    }
}
