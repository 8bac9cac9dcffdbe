//! serialfleet keeps a fleet of serial-attached request/response devices
//! continuously reachable by stable device identity.
//!
//! Serial hardware is transient: ports appear and disappear, devices reboot
//! mid-conversation, and the same device may come back on a different port
//! path. This crate hides all of that behind one operation: send a command
//! to the device with identity `D` and get its response.
//!
//! Two layers do the work:
//!
//! - [`port::PortManager`] owns a single port path. It opens the port,
//!   identifies the device behind it with a caller-supplied probe, serves a
//!   FIFO request queue with quiescence-based response framing, and loops
//!   through reconnection whenever the cable or the device misbehaves.
//! - [`device::DeviceManager`] owns the fleet. It enumerates ports, asks a
//!   caller-supplied policy which ports to adopt, and keeps the mapping
//!   from device identity to the port manager currently holding it.
//!
//! Devices are addressed by what they report, not where they are plugged in.

pub mod device;
pub mod port;
pub mod serial;

pub use device::{DeviceEntry, DeviceEvent, DeviceManager, DeviceManagerBuilder};
pub use port::{
    OptionPolicy, PortConfig, PortEvent, PortManager, PortStatus, RequestError, RequestOptions,
};
pub use serial::{PortInfo, SerialError};
