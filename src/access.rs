use enumflags2::{bitflags, BitFlags};
use rdma_sys::ibv_access_flags;

/// A wrapper for `ibv_access_flags`, hiding the ibv binding types.
#[bitflags]
#[repr(u64)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum AccessFlag {
    /// local write permission
    LocalWrite,
    /// remote write permission
    RemoteWrite,
    /// remote read permission
    RemoteRead,
}

/// Convert `BitFlags<AccessFlag>` into `ibv_access_flags`
pub(crate) fn flags_into_ibv_access(flags: BitFlags<AccessFlag>) -> ibv_access_flags {
    let mut ret = ibv_access_flags(0);
    if flags.contains(AccessFlag::LocalWrite) {
        ret |= ibv_access_flags::IBV_ACCESS_LOCAL_WRITE;
    }
    if flags.contains(AccessFlag::RemoteWrite) {
        ret |= ibv_access_flags::IBV_ACCESS_REMOTE_WRITE;
    }
    if flags.contains(AccessFlag::RemoteRead) {
        ret |= ibv_access_flags::IBV_ACCESS_REMOTE_READ;
    }
    ret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_mapping() {
        let flags = AccessFlag::LocalWrite | AccessFlag::RemoteWrite;
        let ibv = flags_into_ibv_access(flags);
        assert_ne!((ibv & ibv_access_flags::IBV_ACCESS_LOCAL_WRITE).0, 0);
        assert_ne!((ibv & ibv_access_flags::IBV_ACCESS_REMOTE_WRITE).0, 0);
        assert_eq!((ibv & ibv_access_flags::IBV_ACCESS_REMOTE_READ).0, 0);
    }
}
