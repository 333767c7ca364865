//! Probe backed by the SEGGER J-Link shared library.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr, CString};

use crate::error::Operation;
use crate::library::{library_path, ActiveLoader, Loader};
use crate::probe::{Interface, Probe, ProbeConfig};
use crate::Error;

type OpenFn = unsafe extern "C" fn() -> *const c_char;
type CloseFn = unsafe extern "C" fn();
type ExecCommandFn = unsafe extern "C" fn(*const c_char, *mut c_char, c_int) -> c_int;
type TifSelectFn = unsafe extern "C" fn(c_int) -> c_int;
type SetSpeedFn = unsafe extern "C" fn(u32);
type ConnectFn = unsafe extern "C" fn() -> c_int;
type ReadMemFn = unsafe extern "C" fn(u32, u32, *mut c_void) -> c_int;
type WriteU32Fn = unsafe extern "C" fn(u32, u32) -> c_int;
type RttControlFn = unsafe extern "C" fn(c_uint, *mut c_void) -> c_int;
type RttReadFn = unsafe extern "C" fn(c_uint, *mut c_char, c_uint) -> c_int;

const RTTERMINAL_CMD_START: c_uint = 0;
const RTTERMINAL_CMD_STOP: c_uint = 1;

const TIF_JTAG: c_int = 0;
const TIF_SWD: c_int = 1;

#[repr(C)]
struct RttStart {
    config_block_address: u32,
    dummy: [u32; 3],
}

#[repr(C)]
struct RttStop {
    invalidate_target_cb: u8,
    dummy: [u8; 3],
    dummy2: [u32; 3],
}

fn interface_code(interface: Interface) -> c_int {
    match interface {
        Interface::Jtag => TIF_JTAG,
        Interface::Swd => TIF_SWD,
    }
}

/// `JLINKARM_TIF_Select` returns 0 when the interface was selected.
fn check_interface_selected(interface: Interface, status: c_int) -> Result<(), Error> {
    if status == 0 {
        Ok(())
    } else {
        Err(Error::ConnectionFailed(format!(
            "selecting interface {interface:?} returned {status}"
        )))
    }
}

/// Entry points resolved from the J-Link library.
#[derive(Clone, Copy)]
struct Api {
    open: OpenFn,
    close: CloseFn,
    exec_command: ExecCommandFn,
    tif_select: TifSelectFn,
    set_speed: SetSpeedFn,
    connect: ConnectFn,
    read_mem: ReadMemFn,
    write_u32: WriteU32Fn,
    rtt_control: Option<RttControlFn>,
    rtt_read: Option<RttReadFn>,
}

impl Api {
    /// # Safety
    ///
    /// The returned pointers are only valid while `library` stays loaded.
    unsafe fn resolve(library: &<ActiveLoader as Loader>::Library) -> Result<Self, Error> {
        unsafe {
            let api = Self {
                open: ActiveLoader::resolve(library, "JLINKARM_Open")?,
                close: ActiveLoader::resolve(library, "JLINKARM_Close")?,
                exec_command: ActiveLoader::resolve(library, "JLINKARM_ExecCommand")?,
                tif_select: ActiveLoader::resolve(library, "JLINKARM_TIF_Select")?,
                set_speed: ActiveLoader::resolve(library, "JLINKARM_SetSpeed")?,
                connect: ActiveLoader::resolve(library, "JLINKARM_Connect")?,
                read_mem: ActiveLoader::resolve(library, "JLINKARM_ReadMem")?,
                write_u32: ActiveLoader::resolve(library, "JLINKARM_WriteU32")?,
                rtt_control: ActiveLoader::resolve(library, "JLINK_RTTERMINAL_Control").ok(),
                rtt_read: ActiveLoader::resolve(library, "JLINK_RTTERMINAL_Read").ok(),
            };

            if api.rtt_control.is_none() || api.rtt_read.is_none() {
                tracing::debug!("J-Link library has no native RTT support");
            }

            Ok(api)
        }
    }
}

/// A J-Link connection.
///
/// Owns the loaded library; closing the probe (or dropping it) unloads the library exactly
/// once.
pub struct JLinkProbe {
    api: Api,
    library: Option<<ActiveLoader as Loader>::Library>,
    rtt_started: bool,
}

impl JLinkProbe {
    /// Loads the J-Link library from its platform location and connects to the target.
    pub fn open(config: &ProbeConfig) -> Result<Self, Error> {
        let path = library_path();
        let library = ActiveLoader::open(&path)?;
        tracing::debug!("Loaded probe library {}", path.display());

        // SAFETY: the pointers are stored next to the library and dropped before it.
        let api = match unsafe { Api::resolve(&library) } {
            Ok(api) => api,
            Err(error) => {
                ActiveLoader::close(library);
                return Err(error);
            }
        };

        let mut probe = Self {
            api,
            library: Some(library),
            rtt_started: false,
        };

        if let Err(error) = probe.connect(config) {
            probe.release();
            return Err(error);
        }

        Ok(probe)
    }

    fn connect(&mut self, config: &ProbeConfig) -> Result<(), Error> {
        // SAFETY: the library is loaded and the calls follow the documented J-Link sequence.
        unsafe {
            let error = (self.api.open)();
            if !error.is_null() {
                let message = CStr::from_ptr(error).to_string_lossy().into_owned();
                return Err(Error::ConnectionFailed(message));
            }

            if let Some(device) = &config.device {
                self.exec_command(&format!("Device = {device}"))?;
            }

            let status = (self.api.tif_select)(interface_code(config.interface));
            check_interface_selected(config.interface, status)?;
            (self.api.set_speed)(config.speed_khz);

            let status = (self.api.connect)();
            if status < 0 {
                return Err(Error::ConnectionFailed(format!(
                    "connecting to the target returned {status}"
                )));
            }
        }

        tracing::debug!(
            "Connected to {} over {:?} at {} kHz",
            config.device.as_deref().unwrap_or("(unspecified device)"),
            config.interface,
            config.speed_khz
        );

        Ok(())
    }

    fn exec_command(&mut self, command: &str) -> Result<(), Error> {
        let command = CString::new(command)
            .map_err(|_| Error::InvalidConfig(format!("Command contains a NUL byte: {command:?}")))?;
        let mut error = [0 as c_char; 256];

        // SAFETY: both buffers outlive the call. The last byte is kept out of reach of the
        // library so the message is always NUL terminated.
        unsafe {
            (self.api.exec_command)(
                command.as_ptr(),
                error.as_mut_ptr(),
                (error.len() - 1) as c_int,
            );
        }

        // SAFETY: `error` is NUL terminated, see above.
        let message = unsafe { CStr::from_ptr(error.as_ptr()) }.to_string_lossy();
        if message.is_empty() {
            Ok(())
        } else {
            Err(Error::ConnectionFailed(message.into_owned()))
        }
    }

    /// Stops native RTT, closes the connection and unloads the library. Runs at most once.
    fn release(&mut self) {
        let Some(library) = self.library.take() else {
            return;
        };

        // SAFETY: the library is still loaded, it is unloaded right below.
        unsafe {
            if self.rtt_started {
                if let Some(rtt_control) = self.api.rtt_control {
                    let mut stop = RttStop {
                        invalidate_target_cb: 0,
                        dummy: [0; 3],
                        dummy2: [0; 3],
                    };
                    rtt_control(RTTERMINAL_CMD_STOP, (&mut stop as *mut RttStop).cast());
                    tracing::debug!("Stopped native RTT");
                }
                self.rtt_started = false;
            }
            (self.api.close)();
        }

        ActiveLoader::close(library);
        tracing::debug!("Closed probe connection");
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.library.is_some() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }
}

impl Probe for JLinkProbe {
    fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<(), Error> {
        self.ensure_open()?;
        let size = u32::try_from(data.len())
            .map_err(|_| Error::InvalidConfig(format!("Read of {} bytes", data.len())))?;

        // SAFETY: `data` is valid for `size` bytes of writes.
        let status = unsafe { (self.api.read_mem)(address, size, data.as_mut_ptr().cast()) };

        if status != 0 {
            return Err(Error::ProbeIo {
                operation: Operation::ReadMemory,
                address,
                size,
                status,
            });
        }
        Ok(())
    }

    fn write_word_32(&mut self, address: u32, value: u32) -> Result<(), Error> {
        self.ensure_open()?;

        // SAFETY: plain value call into the loaded library.
        let status = unsafe { (self.api.write_u32)(address, value) };

        if status != 0 {
            return Err(Error::ProbeIo {
                operation: Operation::WriteMemory,
                address,
                size: 4,
                status,
            });
        }
        Ok(())
    }

    fn supports_native_rtt(&self) -> bool {
        self.api.rtt_control.is_some() && self.api.rtt_read.is_some()
    }

    fn start_rtt(&mut self, control_block: u32) -> Result<(), Error> {
        self.ensure_open()?;
        let rtt_control = self.api.rtt_control.ok_or(Error::NativeRttUnavailable)?;

        let mut start = RttStart {
            config_block_address: control_block,
            dummy: [0; 3],
        };

        // SAFETY: `start` outlives the call and has the layout the library expects.
        let status =
            unsafe { rtt_control(RTTERMINAL_CMD_START, (&mut start as *mut RttStart).cast()) };

        if status < 0 {
            return Err(Error::ProbeIo {
                operation: Operation::RttControl,
                address: control_block,
                size: 0,
                status,
            });
        }

        self.rtt_started = true;
        tracing::debug!("Started native RTT with control block at {control_block:#010x}");
        Ok(())
    }

    fn rtt_read(&mut self, channel: u32, data: &mut [u8]) -> Result<usize, Error> {
        self.ensure_open()?;
        let rtt_read = self.api.rtt_read.ok_or(Error::NativeRttUnavailable)?;
        let size = u32::try_from(data.len()).unwrap_or(u32::MAX);

        // SAFETY: `data` is valid for `size` bytes of writes.
        let status = unsafe { rtt_read(channel, data.as_mut_ptr().cast(), size) };

        // A count larger than the buffer would mean the library wrote past it; treat as failure.
        match usize::try_from(status) {
            Ok(count) if count <= data.len() => Ok(count),
            _ => Err(Error::ProbeIo {
                operation: Operation::RttRead,
                address: channel,
                size,
                status,
            }),
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        self.ensure_open()?;
        self.release();
        Ok(())
    }
}

impl Drop for JLinkProbe {
    fn drop(&mut self) {
        self.release();
    }
}
