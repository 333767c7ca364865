//! Host side reader for the RTT (Real-Time Transfer) I/O protocol over a SEGGER J-Link probe
//!
//! RTT implements output from a microcontroller using in-memory ring buffers and memory
//! polling. This enables debug logging from the microcontroller with minimal delays and no
//! blocking, making it usable even in real-time applications where e.g. semihosting delays cannot
//! be tolerated.
//!
//! The probe is driven through the vendor's shared library, which is loaded at runtime. Channel
//! data is read either through the library's own RTT engine or by walking the control block in
//! target memory ("soft RTT").
//!
//! ## Example
//!
//! ```no_run
//! use jlink_rtt::{ProbeConfig, RttConfig, RttWrapper, ScanRegion};
//!
//! let probe_config = ProbeConfig {
//!     device: Some("STM32F407VG".to_string()),
//!     ..Default::default()
//! };
//! let config = RttConfig::new(ScanRegion::range(0x2000_0000..0x2002_0000));
//!
//! let mut rtt = RttWrapper::connect(&probe_config, config)?;
//!
//! for channel in rtt.up_channels()? {
//!     println!("{channel}");
//! }
//!
//! let data = rtt.read_rtt(0)?;
//! println!("Read data: {:?}", data);
//!
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#[warn(missing_docs)]
mod error;
#[warn(missing_docs)]
mod jlink;
#[warn(missing_docs)]
pub mod library;
#[warn(missing_docs)]
mod poller;
#[warn(missing_docs)]
mod probe;
#[warn(missing_docs)]
pub mod rtt;
#[warn(missing_docs)]
mod wrapper;


pub use error::{Error, Operation};
pub use jlink::JLinkProbe;
pub use poller::RttPoller;
pub use probe::{Interface, Probe, ProbeConfig};
pub use rtt::{BufferDescriptor, ChannelInfo, ChannelMode, ControlBlock, ScanRegion};
pub use wrapper::{ReadMode, RttConfig, RttWrapper};
