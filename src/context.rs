use crate::device::DeviceList;
use crate::error::{log_last_os_err, log_ret_last_os_err};
use getset::Getters;
use rdma_sys::{ibv_close_device, ibv_context, ibv_device_attr, ibv_open_device, ibv_port_attr};
use std::mem::MaybeUninit;
use std::{fmt::Debug, io, ptr::NonNull};

/// RDMA device context.
///
/// Opens one device and caches the port and device attributes the rest of
/// the crate needs: the port LID for addressing and the device limits for
/// capability checks.
#[derive(Getters)]
pub(crate) struct Context {
    /// internal ibv context
    inner_ctx: NonNull<ibv_context>,
    /// ibv port attribute
    inner_port_attr: ibv_port_attr,
    /// Device attributes
    #[get = "pub(crate)"]
    dev_attr: ibv_device_attr,
    /// The port this context was opened on
    #[get = "pub(crate)"]
    port_num: u8,
}

impl Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("inner_ctx", &self.inner_ctx)
            .field("lid", &self.lid())
            .field("port_num", &self.port_num)
            .finish()
    }
}

impl Context {
    /// Get the internal context pointer
    pub(crate) const fn as_ptr(&self) -> *mut ibv_context {
        self.inner_ctx.as_ptr()
    }

    /// Open a context on the named device, or on the most recently added
    /// device when no name is given.
    pub(crate) fn open(dev_name: Option<&str>, port_num: u8) -> io::Result<Self> {
        let dev_list = DeviceList::available()?;

        let dev = match dev_name {
            Some(name) => dev_list.iter().find(|&d| d.name() == name),
            None => dev_list.get(dev_list.len().saturating_sub(1)),
        }
        .ok_or(io::ErrorKind::NotFound)?;

        // SAFETY: ffi.
        // 1. `dev` is valid now.
        // 2. `*mut ibv_context` does not associate with the lifetime of `*mut ibv_device`.
        let inner_ctx = NonNull::new(unsafe { ibv_open_device(dev.ffi_ptr()) })
            .ok_or_else(|| log_ret_last_os_err("ibv_open_device"))?;

        drop(dev_list);

        // SAFETY: POD FFI type
        let mut inner_port_attr = unsafe { std::mem::zeroed() };
        if unsafe {
            rdma_sys::___ibv_query_port(inner_ctx.as_ptr(), port_num, &mut inner_port_attr)
        } != 0_i32
        {
            let err = log_ret_last_os_err("ibv_query_port");
            // SAFETY: ffi
            let _errno = unsafe { ibv_close_device(inner_ctx.as_ptr()) };
            return Err(err);
        }

        let mut dev_attr = MaybeUninit::<ibv_device_attr>::uninit();
        // SAFETY: ffi
        if unsafe { rdma_sys::ibv_query_device(inner_ctx.as_ptr(), dev_attr.as_mut_ptr()) } != 0_i32
        {
            let err = log_ret_last_os_err("ibv_query_device");
            // SAFETY: ffi
            let _errno = unsafe { ibv_close_device(inner_ctx.as_ptr()) };
            return Err(err);
        }

        Ok(Context {
            inner_ctx,
            inner_port_attr,
            // SAFETY: ffi init
            dev_attr: unsafe { dev_attr.assume_init() },
            port_num,
        })
    }

    /// Get the port LID
    pub(crate) fn lid(&self) -> u16 {
        self.inner_port_attr.lid
    }
}

/// Check if the device capability meets the requirement of `attr_val`.
pub(crate) fn check_dev_cap<T: PartialOrd + std::fmt::Display>(
    attr_val: &T,
    dev_cap: &T,
    attr_name: &str,
) -> io::Result<()> {
    if attr_val > dev_cap {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "the value of {} is {}, which exceeds the hardware capability {}",
                attr_name, attr_val, dev_cap
            ),
        ))
    } else {
        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { ibv_close_device(self.as_ptr()) };
        if errno != 0_i32 {
            log_last_os_err("ibv_close_device");
        }
    }
}

unsafe impl Send for Context {}

unsafe impl Sync for Context {}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn open_default_device() {
        // Skip on hosts without an RDMA device.
        if DeviceList::available().map(|l| l.is_empty()).unwrap_or(true) {
            return;
        }
        let ctx = Context::open(None, 1).unwrap();
        assert_eq!(*ctx.port_num(), 1);
    }

    #[test]
    fn open_unknown_device_fails() {
        if DeviceList::available().map(|l| l.is_empty()).unwrap_or(true) {
            return;
        }
        assert!(Context::open(Some("no-such-device"), 1).is_err());
    }

    #[test]
    fn cap_check() {
        assert!(check_dev_cap(&3_u32, &5_u32, "max_send_sge").is_ok());
        assert!(check_dev_cap(&8_u32, &5_u32, "max_send_sge").is_err());
    }
}
