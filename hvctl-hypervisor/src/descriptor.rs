//! Libvirt domain descriptors.
//!
//! The write side ([`DescriptorBuilder`] / [`DomainDescriptor`]) turns a
//! [`VmSpec`] into a typed domain definition and serialises it with
//! quick-xml's serde support. The read side ([`DomainDocument`]) parses
//! whatever descriptor the hypervisor hands back, keeping only the parts the
//! lifecycle workflows care about.
//!
//! Platform policy encoded here:
//! - memory in KiB (`MiB * 1024`, exact)
//! - boot from cdrom before hd, so install media wins without a boot menu
//! - host-passthrough CPU
//! - system disk on virtio, install and driver ISOs as two read-only SATA
//!   cdroms so the guest installer can load drivers from the second one
//! - one virtio NIC on the named libvirt network
//! - VNC on an auto-assigned port listening on all interfaces

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{HypervisorError, Result};
use crate::types::{DiskFormat, VmSpec};

/// Default libvirt network for new VMs.
pub const DEFAULT_NETWORK: &str = "default";

// =============================================================================
// WRITE SIDE
// =============================================================================

/// Complete domain definition submitted to `define`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename = "domain")]
pub struct DomainDescriptor {
    #[serde(rename = "@type")]
    pub domain_type: String,
    pub name: String,
    pub memory: Memory,
    pub vcpu: u32,
    pub os: Os,
    pub features: Features,
    pub cpu: Cpu,
    pub clock: Clock,
    pub devices: Devices,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Memory {
    #[serde(rename = "@unit")]
    pub unit: String,
    #[serde(rename = "$text")]
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Os {
    #[serde(rename = "type")]
    pub os_type: OsType,
    pub boot: Vec<Boot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OsType {
    #[serde(rename = "@arch")]
    pub arch: String,
    #[serde(rename = "$text")]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Boot {
    #[serde(rename = "@dev")]
    pub dev: String,
}

/// An element with no attributes or content, e.g. `<acpi/>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Flag {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateFlag {
    #[serde(rename = "@state")]
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Features {
    pub acpi: Flag,
    pub apic: Flag,
    pub vmport: StateFlag,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cpu {
    #[serde(rename = "@mode")]
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Clock {
    #[serde(rename = "@offset")]
    pub offset: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Devices {
    pub disk: Vec<Disk>,
    pub controller: Vec<Controller>,
    pub interface: Interface,
    pub graphics: Graphics,
    pub video: Video,
    pub input: Vec<Input>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Disk {
    #[serde(rename = "@type")]
    pub disk_type: String,
    #[serde(rename = "@device")]
    pub device: String,
    pub driver: Driver,
    pub source: FileSource,
    pub target: Target,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readonly: Option<Flag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<DriveAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Driver {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@type")]
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileSource {
    #[serde(rename = "@file")]
    pub file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    #[serde(rename = "@dev")]
    pub dev: String,
    #[serde(rename = "@bus")]
    pub bus: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriveAddress {
    #[serde(rename = "@type")]
    pub address_type: String,
    #[serde(rename = "@controller")]
    pub controller: u32,
    #[serde(rename = "@bus")]
    pub bus: u32,
    #[serde(rename = "@target")]
    pub target: u32,
    #[serde(rename = "@unit")]
    pub unit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Controller {
    #[serde(rename = "@type")]
    pub controller_type: String,
    #[serde(rename = "@index")]
    pub index: u32,
    #[serde(rename = "@model", skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Interface {
    #[serde(rename = "@type")]
    pub interface_type: String,
    pub source: NetworkSource,
    pub model: Model,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkSource {
    #[serde(rename = "@network")]
    pub network: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Model {
    #[serde(rename = "@type")]
    pub model_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Graphics {
    #[serde(rename = "@type")]
    pub graphics_type: String,
    /// -1 asks libvirt to pick a port
    #[serde(rename = "@port")]
    pub port: i32,
    #[serde(rename = "@autoport")]
    pub autoport: String,
    #[serde(rename = "@listen")]
    pub listen: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Video {
    pub model: Model,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Input {
    #[serde(rename = "@type")]
    pub input_type: String,
    #[serde(rename = "@bus")]
    pub bus: String,
}

impl DomainDescriptor {
    /// Serialise to libvirt domain XML.
    pub fn to_xml(&self) -> Result<String> {
        quick_xml::se::to_string(self).map_err(|e| HypervisorError::XmlError(e.to_string()))
    }
}

/// Builder for [`DomainDescriptor`].
pub struct DescriptorBuilder<'a> {
    spec: &'a VmSpec,
    disk_path: &'a Path,
    format: DiskFormat,
    network: String,
}

impl<'a> DescriptorBuilder<'a> {
    /// Create a new builder for the given spec and backing disk.
    pub fn new(spec: &'a VmSpec, disk_path: &'a Path) -> Self {
        Self {
            spec,
            disk_path,
            format: DiskFormat::default(),
            network: DEFAULT_NETWORK.to_string(),
        }
    }

    /// Set the backing disk format.
    pub fn with_format(mut self, format: DiskFormat) -> Self {
        self.format = format;
        self
    }

    /// Attach the NIC to a different libvirt network.
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    /// Build the descriptor.
    ///
    /// Fails only if the memory size does not fit in KiB.
    pub fn build(&self) -> Result<DomainDescriptor> {
        let memory_kib = self.spec.memory_mib.checked_mul(1024).ok_or_else(|| {
            HypervisorError::XmlError(format!("memory {} MiB overflows KiB", self.spec.memory_mib))
        })?;

        Ok(DomainDescriptor {
            domain_type: "kvm".to_string(),
            name: self.spec.name.clone(),
            memory: Memory {
                unit: "KiB".to_string(),
                value: memory_kib,
            },
            vcpu: self.spec.vcpus,
            os: Os {
                os_type: OsType {
                    arch: "x86_64".to_string(),
                    value: "hvm".to_string(),
                },
                boot: vec![
                    Boot { dev: "cdrom".to_string() },
                    Boot { dev: "hd".to_string() },
                ],
            },
            features: Features {
                acpi: Flag {},
                apic: Flag {},
                vmport: StateFlag { state: "off".to_string() },
            },
            cpu: Cpu { mode: "host-passthrough".to_string() },
            clock: Clock { offset: "localtime".to_string() },
            devices: self.build_devices(),
        })
    }

    fn build_devices(&self) -> Devices {
        let mut disk = vec![Disk {
            disk_type: "file".to_string(),
            device: "disk".to_string(),
            driver: Driver {
                name: "qemu".to_string(),
                format: self.format.as_str().to_string(),
            },
            source: FileSource { file: path_string(self.disk_path) },
            target: Target { dev: "vda".to_string(), bus: "virtio".to_string() },
            readonly: None,
            address: None,
        }];

        let media = [&self.spec.install_media, &self.spec.driver_media];
        for (unit, iso) in media.into_iter().enumerate() {
            disk.push(Disk {
                disk_type: "file".to_string(),
                device: "cdrom".to_string(),
                driver: Driver { name: "qemu".to_string(), format: "raw".to_string() },
                source: FileSource { file: path_string(iso) },
                target: Target {
                    dev: format!("sd{}", (b'a' + unit as u8) as char),
                    bus: "sata".to_string(),
                },
                readonly: Some(Flag {}),
                address: Some(DriveAddress {
                    address_type: "drive".to_string(),
                    controller: 0,
                    bus: 0,
                    target: 0,
                    unit: unit as u32,
                }),
            });
        }

        Devices {
            disk,
            controller: vec![
                Controller { controller_type: "sata".to_string(), index: 0, model: None },
                Controller {
                    controller_type: "usb".to_string(),
                    index: 0,
                    model: Some("ich9-ehci1".to_string()),
                },
                Controller {
                    controller_type: "pci".to_string(),
                    index: 0,
                    model: Some("pci-root".to_string()),
                },
            ],
            interface: Interface {
                interface_type: "network".to_string(),
                source: NetworkSource { network: self.network.clone() },
                model: Model { model_type: "virtio".to_string() },
            },
            graphics: Graphics {
                graphics_type: "vnc".to_string(),
                port: -1,
                autoport: "yes".to_string(),
                listen: "0.0.0.0".to_string(),
            },
            video: Video { model: Model { model_type: "virtio".to_string() } },
            input: vec![
                Input { input_type: "tablet".to_string(), bus: "usb".to_string() },
                Input { input_type: "keyboard".to_string(), bus: "ps2".to_string() },
                Input { input_type: "mouse".to_string(), bus: "ps2".to_string() },
            ],
        }
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

// =============================================================================
// READ SIDE
// =============================================================================

/// The parts of a hypervisor-reported descriptor the workflows read.
///
/// Everything not listed here is ignored, so live descriptors with extra
/// devices, aliases and addresses parse fine.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DomainDocument {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub memory: Option<MemoryElement>,
    #[serde(default)]
    pub vcpu: Option<VcpuElement>,
    #[serde(default)]
    pub os: Option<OsElement>,
    #[serde(default)]
    pub devices: DeviceElements,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryElement {
    #[serde(rename = "@unit", default)]
    pub unit: Option<String>,
    #[serde(rename = "$text")]
    pub value: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VcpuElement {
    #[serde(rename = "$text")]
    pub value: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OsElement {
    #[serde(rename = "type", default)]
    pub os_type: Option<OsTypeElement>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OsTypeElement {
    #[serde(rename = "@arch", default)]
    pub arch: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceElements {
    #[serde(default)]
    pub disk: Vec<DiskElement>,
    #[serde(default)]
    pub graphics: Vec<GraphicsElement>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiskElement {
    #[serde(rename = "@device", default)]
    pub device: Option<String>,
    #[serde(default)]
    pub source: Option<SourceElement>,
    #[serde(default)]
    pub target: Option<TargetElement>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetElement {
    #[serde(rename = "@dev", default)]
    pub dev: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceElement {
    #[serde(rename = "@file", default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GraphicsElement {
    #[serde(rename = "@type", default)]
    pub graphics_type: Option<String>,
    #[serde(rename = "@port", default)]
    pub port: Option<String>,
}

impl DomainDocument {
    /// Parse a libvirt domain XML document.
    pub fn from_xml(xml: &str) -> Result<Self> {
        quick_xml::de::from_str(xml).map_err(|e| HypervisorError::XmlError(e.to_string()))
    }

    /// File backing the first hard disk. Cdroms and non-file disks are skipped.
    pub fn primary_disk_path(&self) -> Option<PathBuf> {
        self.devices
            .disk
            .iter()
            .filter(|d| d.device.as_deref().unwrap_or("disk") == "disk")
            .find_map(|d| d.source.as_ref().and_then(|s| s.file.clone()))
            .filter(|f| !f.is_empty())
            .map(PathBuf::from)
    }

    /// Configured memory converted to MiB.
    pub fn memory_mib(&self) -> Option<u64> {
        let memory = self.memory.as_ref()?;
        let multiplier: u64 = match memory.unit.as_deref().unwrap_or("KiB") {
            "b" | "bytes" => 1,
            "KB" => 1000,
            "k" | "KiB" => 1024,
            "MB" => 1000 * 1000,
            "M" | "MiB" => 1024 * 1024,
            "GB" => 1000 * 1000 * 1000,
            "G" | "GiB" => 1024 * 1024 * 1024,
            _ => return None,
        };
        Some(memory.value.saturating_mul(multiplier) / (1024 * 1024))
    }

    /// Number of vCPUs.
    pub fn vcpus(&self) -> Option<u32> {
        self.vcpu.as_ref().map(|v| v.value)
    }

    /// Guest architecture.
    pub fn arch(&self) -> Option<String> {
        self.os.as_ref()?.os_type.as_ref()?.arch.clone()
    }

    /// Assigned VNC port. `None` if VNC is absent or the port is still `-1`.
    pub fn vnc_port(&self) -> Option<u16> {
        self.devices
            .graphics
            .iter()
            .find(|g| g.graphics_type.as_deref() == Some("vnc"))
            .and_then(|g| g.port.as_deref())
            .and_then(|p| p.parse::<u16>().ok())
    }

    /// Whether a VNC display is configured at all.
    pub fn has_vnc(&self) -> bool {
        self.devices
            .graphics
            .iter()
            .any(|g| g.graphics_type.as_deref() == Some("vnc"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> VmSpec {
        VmSpec::new("test-vm", "/isos/install.iso", "/isos/virtio-win.iso")
    }

    #[test]
    fn test_memory_conversion_is_exact() {
        let spec = spec().with_memory(2048);
        let desc = DescriptorBuilder::new(&spec, Path::new("/images/test-vm.qcow2")).build().unwrap();
        assert_eq!(desc.memory.unit, "KiB");
        assert_eq!(desc.memory.value, 2_097_152);
    }

    #[test]
    fn test_memory_overflow_is_an_error() {
        let spec = spec().with_memory(u64::MAX / 512);
        let result = DescriptorBuilder::new(&spec, Path::new("/images/test-vm.qcow2")).build();
        assert!(matches!(result, Err(HypervisorError::XmlError(_))));
    }

    #[test]
    fn test_platform_defaults() {
        let spec = spec().with_vcpus(4);
        let desc = DescriptorBuilder::new(&spec, Path::new("/images/test-vm.qcow2")).build().unwrap();

        assert_eq!(desc.domain_type, "kvm");
        assert_eq!(desc.vcpu, 4);
        let boot: Vec<&str> = desc.os.boot.iter().map(|b| b.dev.as_str()).collect();
        assert_eq!(boot, vec!["cdrom", "hd"]);
        assert_eq!(desc.cpu.mode, "host-passthrough");
        assert_eq!(desc.devices.interface.source.network, "default");
        assert_eq!(desc.devices.graphics.port, -1);
        assert_eq!(desc.devices.graphics.listen, "0.0.0.0");
    }

    #[test]
    fn test_disk_and_media_layout() {
        let spec = spec();
        let desc = DescriptorBuilder::new(&spec, Path::new("/images/test-vm.qcow2")).build().unwrap();
        let disks = &desc.devices.disk;

        assert_eq!(disks.len(), 3);
        assert_eq!(disks[0].device, "disk");
        assert_eq!(disks[0].target.bus, "virtio");
        assert_eq!(disks[0].source.file, "/images/test-vm.qcow2");
        assert!(disks[0].readonly.is_none());

        for (i, iso) in ["/isos/install.iso", "/isos/virtio-win.iso"].iter().enumerate() {
            let cdrom = &disks[i + 1];
            assert_eq!(cdrom.device, "cdrom");
            assert_eq!(cdrom.source.file, *iso);
            assert_eq!(cdrom.target.bus, "sata");
            assert!(cdrom.readonly.is_some());
            assert_eq!(cdrom.address.as_ref().map(|a| a.unit), Some(i as u32));
        }
    }

    #[test]
    fn test_raw_format_and_custom_network() {
        let spec = spec();
        let desc = DescriptorBuilder::new(&spec, Path::new("/images/test-vm.img"))
            .with_format(DiskFormat::Raw)
            .with_network("lab")
            .build()
            .unwrap();
        assert_eq!(desc.devices.disk[0].driver.format, "raw");
        assert_eq!(desc.devices.interface.source.network, "lab");
    }

    #[test]
    fn test_generated_xml_parses_back() {
        let spec = spec().with_memory(4096).with_vcpus(3);
        let xml = DescriptorBuilder::new(&spec, Path::new("/images/test-vm.qcow2"))
            .build()
            .unwrap()
            .to_xml()
            .unwrap();

        assert!(xml.starts_with("<domain"));
        assert!(xml.contains("<name>test-vm</name>"));

        let doc = DomainDocument::from_xml(&xml).unwrap();
        assert_eq!(doc.name, "test-vm");
        assert_eq!(doc.memory_mib(), Some(4096));
        assert_eq!(doc.vcpus(), Some(3));
        assert_eq!(doc.arch().as_deref(), Some("x86_64"));
        assert_eq!(doc.primary_disk_path(), Some(PathBuf::from("/images/test-vm.qcow2")));
        assert!(doc.has_vnc());
        assert_eq!(doc.vnc_port(), None);
    }

    #[test]
    fn test_parse_live_descriptor_skips_cdrom() {
        let xml = r#"<domain type='kvm' id='3'>
  <name>legacy</name>
  <uuid>6f1c5a3e-2b7a-4d0c-9a51-1d2e3f4a5b6c</uuid>
  <memory unit='KiB'>4194304</memory>
  <currentMemory unit='KiB'>4194304</currentMemory>
  <vcpu placement='static'>2</vcpu>
  <os>
    <type arch='x86_64' machine='pc-q35-8.2'>hvm</type>
    <boot dev='cdrom'/>
  </os>
  <devices>
    <emulator>/usr/bin/qemu-system-x86_64</emulator>
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='/isos/install.iso' index='2'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/mnt/shared/golden.qcow2' index='1'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <graphics type='vnc' port='5901' autoport='yes' listen='0.0.0.0'>
      <listen type='address' address='0.0.0.0'/>
    </graphics>
  </devices>
</domain>"#;

        let doc = DomainDocument::from_xml(xml).unwrap();
        assert_eq!(doc.name, "legacy");
        assert_eq!(doc.uuid.as_deref(), Some("6f1c5a3e-2b7a-4d0c-9a51-1d2e3f4a5b6c"));
        assert_eq!(doc.memory_mib(), Some(4096));
        assert_eq!(doc.primary_disk_path(), Some(PathBuf::from("/mnt/shared/golden.qcow2")));
        let targets: Vec<_> = doc
            .devices
            .disk
            .iter()
            .filter_map(|d| d.target.as_ref()?.dev.as_deref())
            .collect();
        assert_eq!(targets, vec!["sda", "vda"]);
        assert_eq!(doc.vnc_port(), Some(5901));
    }

    #[test]
    fn test_parse_descriptor_without_disks() {
        let doc = DomainDocument::from_xml("<domain type='kvm'><name>bare</name></domain>").unwrap();
        assert_eq!(doc.primary_disk_path(), None);
        assert_eq!(doc.memory_mib(), None);
        assert!(!doc.has_vnc());
    }

    #[test]
    fn test_malformed_descriptor_is_an_error() {
        assert!(DomainDocument::from_xml("<domain><name>oops</domain>").is_err());
    }
}
