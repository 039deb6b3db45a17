use crate::error::last_os_err;
use clippy_utilities::Cast;
use rdma_sys::{ibv_device, ibv_free_device_list, ibv_get_device_list, ibv_get_device_name};
use scopeguard::guard_on_unwind;
use std::ffi::CStr;
use std::io;
use std::ops::Deref;
use std::os::raw::c_int;
use std::ptr::NonNull;
use std::{fmt, slice};

/// The array of RDMA devices present on this host.
pub(crate) struct DeviceList {
    /// Base address of the device array
    arr: NonNull<Device>,
    /// Number of devices
    len: usize,
}

/// SAFETY: owned array
unsafe impl Send for DeviceList {}
/// SAFETY: owned array
unsafe impl Sync for DeviceList {}

/// One RDMA device.
#[repr(transparent)]
pub(crate) struct Device(NonNull<ibv_device>);

/// SAFETY: owned type
unsafe impl Send for Device {}
/// SAFETY: owned type
unsafe impl Sync for Device {}

impl DeviceList {
    /// Returns `*mut *mut ibv_device` for the free call
    fn ffi_ptr(&self) -> *mut *mut ibv_device {
        self.arr.as_ptr().cast()
    }

    /// Enumerate the available RDMA devices.
    pub(crate) fn available() -> io::Result<Self> {
        // SAFETY: ffi
        unsafe {
            let mut num_devices: c_int = 0;
            let arr = ibv_get_device_list(&mut num_devices);
            if arr.is_null() {
                return Err(last_os_err());
            }

            // SAFETY: repr(transparent)
            let arr: NonNull<Device> = NonNull::new_unchecked(arr.cast());

            let _guard = guard_on_unwind((), |()| ibv_free_device_list(arr.as_ptr().cast()));

            let len: usize = num_devices.cast();

            Ok(Self { arr, len })
        }
    }

    /// The devices as a slice
    pub(crate) fn as_slice(&self) -> &[Device] {
        // SAFETY: guaranteed by `DeviceList::available`
        unsafe { slice::from_raw_parts(self.arr.as_ptr(), self.len) }
    }
}

impl Drop for DeviceList {
    fn drop(&mut self) {
        // SAFETY: ffi
        unsafe { ibv_free_device_list(self.ffi_ptr()) }
    }
}

impl Deref for DeviceList {
    type Target = [Device];

    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl fmt::Debug for DeviceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <[Device] as fmt::Debug>::fmt(self, f)
    }
}

impl Device {
    /// Returns `*mut ibv_device`
    pub(crate) fn ffi_ptr(&self) -> *mut ibv_device {
        self.0.as_ptr()
    }

    /// Kernel device name
    pub(crate) fn c_name(&self) -> &CStr {
        // SAFETY: ffi
        unsafe { CStr::from_ptr(ibv_get_device_name(self.ffi_ptr())) }
    }

    /// Kernel device name as utf8
    pub(crate) fn name(&self) -> &str {
        self.c_name().to_str().unwrap_or("<non-utf8 device name>")
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device").field("name", &self.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker() {
        fn require_send_sync<T: Send + Sync>() {}

        require_send_sync::<Device>();
        require_send_sync::<DeviceList>();
    }

    #[test]
    fn enumerate() {
        // An empty list is fine on hosts without RDMA hardware, an error is
        // fine on hosts without the ib_uverbs module. Only the happy path is
        // checked for consistency.
        if let Ok(list) = DeviceList::available() {
            for dev in list.iter() {
                assert!(!dev.name().is_empty());
            }
        }
    }
}
