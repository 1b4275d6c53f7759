//! Fixed-width lease records (spec.md §3.2, component A).
//!
//! A lease identifies a client's claim that a share should be retained
//! until `expiration_time`. Renewal re-stamps `expiration_time`; it never
//! changes `renew_secret` (that's the identity of the lease).

use binrw::{BinRead, BinWrite};
use storage_types::{CancelSecret, RenewSecret};

/// On-disk size of one lease record, in bytes: 4 (owner) + 32 (renew) + 32
/// (cancel) + 4 (expiration).
pub const LEASE_RECORD_LEN: usize = 72;

/// Default lease duration applied by `add_lease` and by a successful
/// `slot_testv_and_readv_and_writev` that doesn't already hold a lease for
/// the given renew secret (spec.md §4.E).
pub const DEFAULT_LEASE_DURATION_SECS: u32 = 31 * 24 * 60 * 60;

/// A single lease record, exactly as it appears on disk.
#[derive(BinRead, BinWrite, Debug, Clone, Copy, PartialEq, Eq)]
#[brw(big)]
pub struct LeaseRecord {
    pub owner_num: u32,
    #[br(map = |x: [u8; 32]| RenewSecret::new(x))]
    #[bw(map = |s: &RenewSecret| *s.as_bytes())]
    pub renew_secret: RenewSecret,
    #[br(map = |x: [u8; 32]| CancelSecret::new(x))]
    #[bw(map = |s: &CancelSecret| *s.as_bytes())]
    pub cancel_secret: CancelSecret,
    pub expiration_time: u32,
}

impl LeaseRecord {
    pub fn new(
        owner_num: u32,
        renew_secret: RenewSecret,
        cancel_secret: CancelSecret,
        expiration_time: u32,
    ) -> Self {
        Self {
            owner_num,
            renew_secret,
            cancel_secret,
            expiration_time,
        }
    }

    /// A fresh 31-day lease starting at `now`, per spec.md §4.E step 5.
    pub fn fresh(owner_num: u32, renew_secret: RenewSecret, cancel_secret: CancelSecret, now: u32) -> Self {
        Self::new(
            owner_num,
            renew_secret,
            cancel_secret,
            now.saturating_add(DEFAULT_LEASE_DURATION_SECS),
        )
    }

    /// Renews this lease to `now + 31 days`, in place.
    pub fn renew(&mut self, now: u32) {
        self.expiration_time = now.saturating_add(DEFAULT_LEASE_DURATION_SECS);
    }

    pub fn is_expired(&self, now: u32) -> bool {
        self.expiration_time < now
    }

    /// The instant this lease was last renewed, derived from the default
    /// 31-day policy. Used by the `age`-mode expirer (spec.md §4.H) to
    /// measure "more than `override_duration` seconds since last renewal".
    pub fn last_renewed_at(&self) -> u32 {
        self.expiration_time
            .saturating_sub(DEFAULT_LEASE_DURATION_SECS)
    }

    pub fn to_bytes(&self) -> [u8; LEASE_RECORD_LEN] {
        let mut cursor = binrw::io::Cursor::new([0u8; LEASE_RECORD_LEN]);
        self.write(&mut cursor).expect("fixed-size write cannot fail");
        cursor.into_inner()
    }

    pub fn from_bytes(buf: &[u8]) -> crate::Result<Self> {
        if buf.len() < LEASE_RECORD_LEN {
            return Err(crate::FormatError::MalformedLease(buf.len(), LEASE_RECORD_LEN));
        }
        let mut cursor = binrw::io::Cursor::new(buf);
        Self::read(&mut cursor).map_err(|e| crate::FormatError::Corrupt(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_bytes() {
        let lease = LeaseRecord::new(
            0,
            RenewSecret::new([1u8; 32]),
            CancelSecret::new([2u8; 32]),
            1_700_000_000,
        );
        let bytes = lease.to_bytes();
        assert_eq!(bytes.len(), LEASE_RECORD_LEN);
        let back = LeaseRecord::from_bytes(&bytes).unwrap();
        assert_eq!(lease, back);
    }

    #[test]
    fn renew_sets_absolute_expiration() {
        let mut lease = LeaseRecord::fresh(0, RenewSecret::new([0u8; 32]), CancelSecret::new([0u8; 32]), 1000);
        assert_eq!(lease.expiration_time, 1000 + DEFAULT_LEASE_DURATION_SECS);
        lease.renew(5000);
        assert_eq!(lease.expiration_time, 5000 + DEFAULT_LEASE_DURATION_SECS);
    }

    #[test]
    fn expiry_is_absolute_not_duration() {
        let lease = LeaseRecord::new(0, RenewSecret::new([0u8; 32]), CancelSecret::new([0u8; 32]), 100);
        assert!(lease.is_expired(101));
        assert!(!lease.is_expired(100));
        assert!(!lease.is_expired(99));
    }
}
