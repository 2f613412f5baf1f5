use log::{debug, info};
use pcap::{Active, Capture, Device, Linktype};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::capture::frame::{CaptureError, FrameSource, LinkType, RawFrame};
use crate::config::CaptureConfig;

/// libpcap-backed frame source bound to a single interface.
pub struct PcapEngine {
    capture: Option<Capture<Active>>,
    interface: String,
    link_type: LinkType,
}

impl PcapEngine {
    pub fn open(config: &CaptureConfig) -> Result<Self, CaptureError> {
        let interface = match &config.interface {
            Some(name) => name.clone(),
            None => Self::default_interface()?,
        };

        if interface != "any" {
            let available_devices = Self::list_devices()?;
            if !available_devices.iter().any(|d| d.name == interface) {
                let device_names: Vec<String> = available_devices.iter()
                    .map(|d| d.name.clone())
                    .collect();
                return Err(CaptureError::InterfaceNotFound(interface, device_names));
            }
        }

        debug!("Opening capture on interface {} (snaplen {}, timeout {} ms)", interface, config.snaplen, config.timeout_ms);

        let unavailable = |e: pcap::Error| CaptureError::Unavailable {
            interface: interface.clone(),
            reason: e.to_string(),
        };

        let capture = Capture::from_device(Device::from(interface.as_str()))
            .map_err(unavailable)?
            .promisc(config.promiscuous)
            .snaplen(config.snaplen)
            .timeout(config.timeout_ms)
            .buffer_size(config.buffer_size)
            .immediate_mode(true)
            .open()
            .map_err(unavailable)?;

        let datalink = capture.get_datalink();
        let link_type = Self::link_type_of(datalink).ok_or_else(|| CaptureError::Unavailable {
            interface: interface.clone(),
            reason: format!("unsupported link type {:?}", datalink),
        })?;

        info!("Capturing on interface {} ({:?} framing)", interface, link_type);

        Ok(PcapEngine {
            capture: Some(capture),
            interface,
            link_type,
        })
    }

    pub fn list_devices() -> Result<Vec<Device>, CaptureError> {
        Device::list().map_err(|e| CaptureError::Unavailable {
            interface: "*".to_string(),
            reason: format!("failed to list devices: {}", e),
        })
    }

    /// The host's primary interface, falling back to the first listed device.
    pub fn default_interface() -> Result<String, CaptureError> {
        if let Ok(Some(device)) = Device::lookup() {
            return Ok(device.name);
        }
        Self::list_devices()?
            .into_iter()
            .next()
            .map(|d| d.name)
            .ok_or_else(|| CaptureError::Unavailable {
                interface: "*".to_string(),
                reason: "no capture devices found".to_string(),
            })
    }

    fn link_type_of(datalink: Linktype) -> Option<LinkType> {
        match datalink {
            Linktype::ETHERNET => Some(LinkType::Ethernet),
            Linktype::LINUX_SLL => Some(LinkType::LinuxSll),
            Linktype::RAW | Linktype::IPV4 | Linktype::IPV6 => Some(LinkType::RawIp),
            _ => None,
        }
    }
}

fn header_timestamp(header: &pcap::PacketHeader) -> SystemTime {
    let secs = u64::try_from(header.ts.tv_sec).unwrap_or(0);
    let micros = u64::try_from(header.ts.tv_usec).unwrap_or(0);
    UNIX_EPOCH + Duration::from_secs(secs) + Duration::from_micros(micros)
}

impl FrameSource for PcapEngine {
    fn interface(&self) -> &str {
        &self.interface
    }

    fn link_type(&self) -> LinkType {
        self.link_type
    }

    fn next_frame(&mut self) -> Result<Option<RawFrame>, CaptureError> {
        let capture = self.capture.as_mut()
            .ok_or_else(|| CaptureError::Terminated("capture handle closed".to_string()))?;

        match capture.next_packet() {
            Ok(packet) => {
                let frame = RawFrame::with_wire_length(
                    packet.data.to_vec(),
                    packet.header.len as usize,
                    header_timestamp(packet.header),
                );
                Ok(Some(frame))
            },
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(e) => Err(CaptureError::Terminated(format!("{} on {}", e, self.interface))),
        }
    }

    fn close(&mut self) {
        if self.capture.take().is_some() {
            debug!("Closed capture handle on {}", self.interface);
        }
    }

    fn is_closed(&self) -> bool {
        self.capture.is_none()
    }
}
