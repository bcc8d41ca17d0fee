//! Emulated Device Registry (spec section 4.4): allocates addresses on a
//! synthetic USB bus, owns one `MsdDevice` per emulated CD, and reports
//! create/eject events to an `EventSink`.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::backing::BackingStream;
use crate::config::{BusConfig, LunConfig};
use crate::msd::MsdDevice;
use crate::scsi::LuIdentity;
use crate::types::CdEmuError;

/// Callbacks supplied by the host (spec section 6, "Events out"). Hotplug
/// and device-change carry structured data a log line would lose, so they
/// stay explicit callbacks rather than folding into `tracing`.
pub trait EventSink: Send + Sync {
    fn hotplug(&self, added: bool, device: &EmulatedDevice);
    fn device_change(&self, device: &EmulatedDevice);
}

/// One emulated composite USB device: a synthetic bus address plus its
/// Mass-Storage backend (spec section 3, "Emulated USB Device").
pub struct EmulatedDevice {
    pub address: u8,
    pub bus_number: u8,
    pub serial: String,
    pub locked: bool,
    pub delete_on_eject: bool,
    deleting: bool,
    pub msd: MsdDevice,
}

impl EmulatedDevice {
    /// Identification bytes reported by the SCSI INQUIRY of LUN 0, kept
    /// here too since the USB serial-string descriptor is derived from the
    /// same value (spec section 6).
    pub fn serial_descriptor(&self) -> &str {
        &self.serial
    }
}

fn pad_ascii(s: &str, len: usize) -> String {
    let mut out: String = s.chars().take(len).collect();
    while out.len() < len {
        out.push(' ');
    }
    out
}

/// Allocates addresses `[address_min..=address_max]` on one synthetic bus
/// and owns every emulated device created on it. Addresses `0` and `1` are
/// never handed out (spec section 4.4).
pub struct Registry {
    bus: BusConfig,
    devices: BTreeMap<u8, EmulatedDevice>,
}

impl Registry {
    pub fn new(bus: BusConfig) -> Self {
        Self {
            bus,
            devices: BTreeMap::new(),
        }
    }

    pub fn bus_number(&self) -> u8 {
        self.bus.bus_number
    }

    pub fn get(&self, address: u8) -> Option<&EmulatedDevice> {
        self.devices.get(&address)
    }

    pub fn get_mut(&mut self, address: u8) -> Option<&mut EmulatedDevice> {
        self.devices.get_mut(&address)
    }

    /// Addresses currently allocated, lowest first. Used by the service
    /// shell to pick the device a freshly connected usbredir peer attaches
    /// to (spec section 4.4 makes no multi-peer-per-device claim, so the
    /// shell hands the whole bus to each connecting peer).
    pub fn addresses(&self) -> Vec<u8> {
        self.devices.keys().copied().collect()
    }

    fn alloc_address(&mut self) -> Option<u8> {
        (self.bus.address_min..=self.bus.address_max).find(|a| !self.devices.contains_key(a))
    }

    /// Reserve an address, realize and (optionally) load LUN 0, and notify
    /// the sink of the new device (spec section 4.4, `create_emulated_cd`).
    pub async fn create_emulated_cd(
        &mut self,
        cfg: &LunConfig,
        sink: &dyn EventSink,
    ) -> Result<u8, CdEmuError> {
        let address = self.alloc_address().ok_or(CdEmuError::NoFreeAddress)?;

        let serial = cfg
            .serial
            .clone()
            .unwrap_or_else(|| format!("{address:012}"));
        let identity = LuIdentity {
            vendor: pad_ascii(&cfg.vendor, 8),
            product: pad_ascii(&cfg.product, 16),
            version: pad_ascii(&cfg.version, 4),
            serial: serial.clone(),
        };

        let mut msd = MsdDevice::new(1);
        msd.realize_lu(0, identity, cfg.cd_rom)
            .map_err(CdEmuError::BackingFile)?;

        if cfg.auto_load {
            let stream = BackingStream::open(&cfg.path).await?;
            msd.target
                .lu_load(0, stream)
                .map_err(CdEmuError::BackingFile)?;
        }

        let device = EmulatedDevice {
            address,
            bus_number: self.bus.bus_number,
            serial,
            locked: false,
            delete_on_eject: false,
            deleting: false,
            msd,
        };
        self.devices.insert(address, device);
        info!(address, lun = cfg.lun, "emulated CD device created");
        sink.hotplug(true, self.devices.get(&address).unwrap());
        Ok(address)
    }

    /// Clear the address's reservation and notify the sink. If
    /// `delete_on_eject` is set and a SCSI request is still in flight, the
    /// device is kept around (marked `deleting`) until
    /// `reap_pending_deletes` observes it idle (spec section 4.4).
    pub fn eject(&mut self, address: u8, sink: &dyn EventSink) {
        let Some(device) = self.devices.get_mut(&address) else {
            warn!(address, "eject of unknown device address");
            return;
        };
        sink.hotplug(false, device);
        if device.delete_on_eject {
            device.deleting = true;
        } else {
            self.devices.remove(&address);
        }
    }

    /// Finalize any device ejected while a SCSI request was in flight, now
    /// that its target has gone idle. Call after every CSW dispatch.
    pub fn reap_pending_deletes(&mut self) {
        let ready: Vec<u8> = self
            .devices
            .iter()
            .filter(|(_, d)| d.deleting && !d.msd.target.request_in_flight)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in ready {
            self.devices.remove(&addr);
            info!(address = addr, "emulated CD device destroyed after eject");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    struct RecordingSink {
        events: Mutex<Vec<(bool, u8)>>,
    }

    impl EventSink for RecordingSink {
        fn hotplug(&self, added: bool, device: &EmulatedDevice) {
            self.events.lock().unwrap().push((added, device.address));
        }
        fn device_change(&self, _device: &EmulatedDevice) {}
    }

    fn backing_file() -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; 4096]).unwrap();
        f
    }

    #[tokio::test]
    async fn create_emulated_cd_assigns_lowest_free_address() {
        let mut registry = Registry::new(BusConfig::default());
        let sink = RecordingSink {
            events: Mutex::new(Vec::new()),
        };
        let f = backing_file();
        let cfg = LunConfig {
            path: f.path().to_path_buf(),
            ..LunConfig::default()
        };
        let addr = registry.create_emulated_cd(&cfg, &sink).await.unwrap();
        assert_eq!(addr, 2);
        assert_eq!(sink.events.lock().unwrap().as_slice(), &[(true, 2)]);
    }

    #[tokio::test]
    async fn eject_without_delete_on_eject_removes_device_immediately() {
        let mut registry = Registry::new(BusConfig::default());
        let sink = RecordingSink {
            events: Mutex::new(Vec::new()),
        };
        let f = backing_file();
        let cfg = LunConfig {
            path: f.path().to_path_buf(),
            ..LunConfig::default()
        };
        let addr = registry.create_emulated_cd(&cfg, &sink).await.unwrap();
        registry.eject(addr, &sink);
        assert!(registry.get(addr).is_none());
        assert_eq!(
            sink.events.lock().unwrap().as_slice(),
            &[(true, addr), (false, addr)]
        );
    }

    #[tokio::test]
    async fn addresses_0_and_1_are_never_allocated() {
        let mut registry = Registry::new(BusConfig::default());
        let sink = RecordingSink {
            events: Mutex::new(Vec::new()),
        };
        for _ in 0..3 {
            let f = backing_file();
            let cfg = LunConfig {
                path: f.path().to_path_buf(),
                ..LunConfig::default()
            };
            let addr = registry.create_emulated_cd(&cfg, &sink).await.unwrap();
            assert!(addr >= 2);
            std::mem::forget(f);
        }
    }
}
