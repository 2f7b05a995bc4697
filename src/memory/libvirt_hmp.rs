use std::ffi::{c_char, c_int, c_uint, c_void, CStr, CString};
use std::ptr;

use libloading::Library;
use log::debug;

use super::parse_hmp::{extract_register, parse_word_dump};
use super::{GuestTransport, Registers, TransportError};

type VirConnectPtr = *mut c_void;
type VirDomainPtr = *mut c_void;

type VirConnectOpenFn = unsafe extern "C" fn(*const c_char) -> VirConnectPtr;
type VirConnectCloseFn = unsafe extern "C" fn(VirConnectPtr) -> c_int;
type VirDomainLookupByNameFn = unsafe extern "C" fn(VirConnectPtr, *const c_char) -> VirDomainPtr;
type VirDomainFreeFn = unsafe extern "C" fn(VirDomainPtr) -> c_int;
type VirDomainQemuMonitorCommandFn =
    unsafe extern "C" fn(VirDomainPtr, *const c_char, *mut *mut c_char, c_uint) -> c_int;

const VIR_DOMAIN_QEMU_MONITOR_COMMAND_HMP: c_uint = 1;

/// Guest memory/register access via libvirt's QEMU monitor passthrough.
///
/// Grounded on `libvirt_client.c`: both `libvirt.so.0` (connection/domain
/// lifecycle) and `libvirt-qemu.so.0` (`virDomainQemuMonitorCommand`) are
/// loaded with `dlopen`/`dlsym` at runtime rather than linked against,
/// so the binary doesn't require libvirt-dev headers or import libraries
/// to build, and works against whatever libvirt happens to be installed.
/// `libloading::Library` keeps the handle; the five symbols are resolved
/// once and kept as bare function pointers, valid for as long as the
/// owning `Library` stays loaded (it's dropped last, in `Drop`).
pub struct LibvirtHmp {
    _libvirt: Library,
    _libvirt_qemu: Library,
    connect_close: VirConnectCloseFn,
    domain_free: VirDomainFreeFn,
    monitor_command: VirDomainQemuMonitorCommandFn,
    conn: VirConnectPtr,
    domain: VirDomainPtr,
}

impl LibvirtHmp {
    pub fn connect(domain_name: &str) -> Result<Self, TransportError> {
        unsafe {
            let libvirt = Library::new("libvirt.so.0")
                .map_err(|e| TransportError::LibvirtUnavailable(e.to_string()))?;
            let libvirt_qemu = Library::new("libvirt-qemu.so.0")
                .map_err(|e| TransportError::LibvirtUnavailable(e.to_string()))?;

            let connect_open: VirConnectOpenFn = *libvirt
                .get::<VirConnectOpenFn>(b"virConnectOpen\0")
                .map_err(|e| TransportError::LibvirtUnavailable(e.to_string()))?;
            let connect_close: VirConnectCloseFn = *libvirt
                .get::<VirConnectCloseFn>(b"virConnectClose\0")
                .map_err(|e| TransportError::LibvirtUnavailable(e.to_string()))?;
            let domain_lookup_by_name: VirDomainLookupByNameFn = *libvirt
                .get::<VirDomainLookupByNameFn>(b"virDomainLookupByName\0")
                .map_err(|e| TransportError::LibvirtUnavailable(e.to_string()))?;
            let domain_free: VirDomainFreeFn = *libvirt
                .get::<VirDomainFreeFn>(b"virDomainFree\0")
                .map_err(|e| TransportError::LibvirtUnavailable(e.to_string()))?;
            let monitor_command: VirDomainQemuMonitorCommandFn = *libvirt_qemu
                .get::<VirDomainQemuMonitorCommandFn>(b"virDomainQemuMonitorCommand\0")
                .map_err(|e| TransportError::LibvirtUnavailable(e.to_string()))?;

            let uri = CString::new("qemu:///system").unwrap();
            let conn = connect_open(uri.as_ptr());
            if conn.is_null() {
                return Err(TransportError::LibvirtCallFailed(
                    "virConnectOpen returned NULL".into(),
                ));
            }

            let name = CString::new(domain_name)
                .map_err(|e| TransportError::LibvirtCallFailed(e.to_string()))?;
            let domain = domain_lookup_by_name(conn, name.as_ptr());
            if domain.is_null() {
                connect_close(conn);
                return Err(TransportError::LibvirtCallFailed(format!(
                    "no such domain: {domain_name}"
                )));
            }

            Ok(Self {
                _libvirt: libvirt,
                _libvirt_qemu: libvirt_qemu,
                connect_close,
                domain_free,
                monitor_command,
                conn,
                domain,
            })
        }
    }

    fn run_hmp(&mut self, command: &str) -> Result<String, TransportError> {
        let cmd = CString::new(command)
            .map_err(|e| TransportError::LibvirtCallFailed(e.to_string()))?;
        let mut result: *mut c_char = ptr::null_mut();
        let rc = unsafe {
            (self.monitor_command)(
                self.domain,
                cmd.as_ptr(),
                &mut result,
                VIR_DOMAIN_QEMU_MONITOR_COMMAND_HMP,
            )
        };
        if rc != 0 || result.is_null() {
            return Err(TransportError::LibvirtCallFailed(format!(
                "virDomainQemuMonitorCommand({command}) failed with rc={rc}"
            )));
        }
        let text = unsafe { CStr::from_ptr(result) }
            .to_string_lossy()
            .into_owned();
        debug!("hmp reply to `{command}`: {} bytes", text.len());
        Ok(text)
    }
}

impl GuestTransport for LibvirtHmp {
    fn read_raw(&mut self, paddr: u64, len: usize) -> Result<Vec<u8>, TransportError> {
        // xp reads in 4-byte words; round up and trim the tail after parsing.
        let words = len.div_ceil(4);
        let command = format!("xp /{words}xw 0x{paddr:x}");
        let text = self.run_hmp(&command)?;
        let mut bytes = parse_word_dump(&text);
        if bytes.len() < len {
            return Err(TransportError::TruncatedDump {
                expected: len,
                got: bytes.len(),
            });
        }
        bytes.truncate(len);
        Ok(bytes)
    }

    fn registers(&mut self) -> Result<Registers, TransportError> {
        let text = self.run_hmp("info registers")?;
        let cr3 =
            extract_register(&text, "CR3").ok_or(TransportError::RegisterNotFound("CR3"))?;
        let idtr =
            extract_register(&text, "IDT").ok_or(TransportError::RegisterNotFound("IDT"))?;
        let cr4 = extract_register(&text, "CR4").unwrap_or(0);
        Ok(Registers { idtr, cr3, cr4 })
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if !self.domain.is_null() {
            unsafe {
                (self.domain_free)(self.domain);
            }
            self.domain = ptr::null_mut();
        }
        if !self.conn.is_null() {
            unsafe {
                (self.connect_close)(self.conn);
            }
            self.conn = ptr::null_mut();
        }
        Ok(())
    }
}

impl Drop for LibvirtHmp {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
