//! Command dispatch and result rendering.

use serde::Serialize;
use serde_json::json;
use std::fmt::Write;

use hvctl_hypervisor::{
    ConsoleInfo, DeleteOutcome, DomainDetails, Inventory, Lifecycle, LifecycleError, ManagedDisk, VmSpec,
};

use crate::cli::Command;

/// Run one command and render its result for stdout.
pub async fn run(lifecycle: &Lifecycle, command: &Command, json: bool) -> Result<String, LifecycleError> {
    let output = match command {
        Command::List => {
            let inventory = lifecycle.list().await?;
            if json { to_json(&inventory) } else { render_inventory(&inventory) }
        }
        Command::Create { name, iso, drivers, memory, vcpus, disk } => {
            let spec = VmSpec::new(name.as_str(), iso, drivers)
                .with_memory(*memory)
                .with_vcpus(*vcpus)
                .with_disk(*disk);
            let created = lifecycle.create(&spec).await?;
            if json { to_json(&created) } else { render_created(name, &created) }
        }
        Command::Start { name } => {
            lifecycle.start(name).await?;
            status(json, name, "started", format!("VM '{}' started", name))
        }
        Command::Stop { name } => {
            lifecycle.stop(name).await?;
            status(json, name, "shutdown_requested", format!("Shutdown requested for VM '{}'", name))
        }
        Command::ForceStop { name } => {
            lifecycle.force_stop(name).await?;
            status(json, name, "stopped", format!("VM '{}' force stopped", name))
        }
        Command::Restart { name } => {
            lifecycle.restart(name).await?;
            status(json, name, "restarted", format!("VM '{}' restarted", name))
        }
        Command::Delete { name } => {
            let outcome = lifecycle.delete(name).await?;
            if json { to_json(&outcome) } else { render_deleted(name, &outcome) }
        }
        Command::Console { name } => {
            let console = lifecycle.console(name).await?;
            if json { to_json(&console) } else { render_console(name, &console) }
        }
        Command::Info { name } => {
            let details = lifecycle.details(name).await?;
            if json { to_json(&details) } else { render_details(&details) }
        }
    };
    Ok(output)
}

/// Render an operation failure.
pub fn render_error(err: &LifecycleError, json: bool) -> String {
    if json {
        to_json(&json!({ "error": { "kind": err.kind(), "message": err.to_string() } }))
    } else {
        format!("Error [{}]: {}", err.kind(), err)
    }
}

fn status(json: bool, name: &str, state: &str, text: String) -> String {
    if json {
        to_json(&json!({ "vm": name, "status": state }))
    } else {
        text
    }
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| serialization_error(&e.to_string()))
}

fn serialization_error(message: &str) -> String {
    json!({ "error": { "kind": "internal", "message": message } }).to_string()
}

fn render_inventory(inventory: &Inventory) -> String {
    if inventory.is_empty() {
        return "No VMs defined".to_string();
    }

    let mut out = String::new();
    let _ = writeln!(out, "Running VMs:");
    if inventory.active.is_empty() {
        let _ = writeln!(out, "  (none)");
    }
    for vm in &inventory.active {
        let _ = writeln!(out, "  [{}] {}", vm.id, vm.name);
    }
    let _ = writeln!(out, "Stopped VMs:");
    if inventory.inactive.is_empty() {
        let _ = writeln!(out, "  (none)");
    }
    for vm in &inventory.inactive {
        let _ = writeln!(out, "  - {}", vm.name);
    }
    out.trim_end().to_string()
}

fn render_created(name: &str, disk: &ManagedDisk) -> String {
    format!(
        "VM '{}' created with a {} GiB disk at {}\nStart it with: hvctl start {}",
        name,
        disk.size_gib,
        disk.path.display(),
        name
    )
}

fn render_deleted(name: &str, outcome: &DeleteOutcome) -> String {
    let mut out = format!("VM '{}' deleted", name);
    if let Some(ref err) = outcome.force_stop_error {
        let _ = write!(out, "\nWarning: force stop before delete failed: {}", err);
    }
    match (&outcome.disk_removed, &outcome.disk_retained) {
        (Some(path), _) => {
            let _ = write!(out, "\nDisk removed: {}", path.display());
        }
        (None, Some(path)) => {
            let _ = write!(out, "\nDisk kept: {}", path.display());
        }
        (None, None) => {}
    }
    out
}

fn render_console(name: &str, console: &ConsoleInfo) -> String {
    format!("VNC console for '{}': vnc://{}:{}", name, console.host, console.port)
}

fn render_details(details: &DomainDetails) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Name:      {}", details.name);
    let _ = writeln!(out, "UUID:      {}", details.uuid);
    let _ = writeln!(out, "State:     {}", if details.running { "running" } else { "shut off" });
    let _ = writeln!(out, "Memory:    {} MiB", details.memory_mib);
    let _ = writeln!(out, "vCPUs:     {}", details.vcpus);
    let _ = writeln!(out, "Arch:      {}", details.arch.as_deref().unwrap_or("unknown"));
    let _ = writeln!(out, "Autostart: {}", if details.autostart { "yes" } else { "no" });
    match details.disk_path {
        Some(ref path) => {
            let _ = writeln!(out, "Disk:      {}", path.display());
        }
        None => {
            let _ = writeln!(out, "Disk:      none");
        }
    }
    if let Some(port) = details.vnc_port {
        let _ = writeln!(out, "VNC port:  {}", port);
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hvctl_hypervisor::{DiskFormat, DiskProvisioner, ImageTool, MockBackend, ToolOutput};
    use std::path::Path;
    use std::sync::Arc;

    struct TouchTool;

    #[async_trait::async_trait]
    impl ImageTool for TouchTool {
        fn name(&self) -> &str {
            "touch"
        }

        async fn create_image(&self, path: &Path, _format: DiskFormat, _size_gib: u64) -> std::io::Result<ToolOutput> {
            std::fs::write(path, b"")?;
            Ok(ToolOutput { exit_code: Some(0), ..Default::default() })
        }
    }

    fn setup(dir: &Path) -> (Lifecycle, Command) {
        let disks = DiskProvisioner::new(dir.join("images"), DiskFormat::Qcow2, Arc::new(TouchTool));
        let lifecycle = Lifecycle::new(Arc::new(MockBackend::new()), disks);

        let iso = dir.join("install.iso");
        let drivers = dir.join("virtio.iso");
        std::fs::write(&iso, b"").unwrap();
        std::fs::write(&drivers, b"").unwrap();

        let create = Command::Create {
            name: "web01".to_string(),
            iso,
            drivers,
            memory: 1024,
            vcpus: 1,
            disk: 8,
        };
        (lifecycle, create)
    }

    #[tokio::test]
    async fn test_create_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let (lifecycle, create) = setup(dir.path());

        let out = run(&lifecycle, &create, false).await.unwrap();
        assert!(out.starts_with("VM 'web01' created with a 8 GiB disk"));

        let out = run(&lifecycle, &Command::Start { name: "web01".to_string() }, false).await.unwrap();
        assert_eq!(out, "VM 'web01' started");

        let out = run(&lifecycle, &Command::List, false).await.unwrap();
        assert!(out.contains("[1] web01"));

        let out = run(&lifecycle, &Command::Delete { name: "web01".to_string() }, false).await.unwrap();
        assert!(out.starts_with("VM 'web01' deleted"));
        assert!(out.contains("Disk removed:"));

        let out = run(&lifecycle, &Command::List, false).await.unwrap();
        assert_eq!(out, "No VMs defined");
    }

    #[tokio::test]
    async fn test_json_output() {
        let dir = tempfile::tempdir().unwrap();
        let (lifecycle, create) = setup(dir.path());
        run(&lifecycle, &create, true).await.unwrap();

        let out = run(&lifecycle, &Command::Info { name: "web01".to_string() }, true).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["name"], "web01");
        assert_eq!(value["memory_mib"], 1024);
        assert_eq!(value["running"], false);
    }

    #[tokio::test]
    async fn test_error_rendering() {
        let dir = tempfile::tempdir().unwrap();
        let (lifecycle, _) = setup(dir.path());

        let err = run(&lifecycle, &Command::Start { name: "ghost".to_string() }, false)
            .await
            .unwrap_err();
        assert_eq!(render_error(&err, false), "Error [not_found]: VM 'ghost' not found");

        let value: serde_json::Value = serde_json::from_str(&render_error(&err, true)).unwrap();
        assert_eq!(value["error"]["kind"], "not_found");
    }

    #[test]
    fn test_serialization_error_is_valid_json() {
        let message = "key must be a string: \"quoted\" \\ path\nnext line";
        let value: serde_json::Value = serde_json::from_str(&serialization_error(message)).unwrap();
        assert_eq!(value["error"]["kind"], "internal");
        assert_eq!(value["error"]["message"], message);
    }

    #[test]
    fn test_unserializable_value_falls_back_to_error_json() {
        let mut map = std::collections::HashMap::new();
        map.insert(vec![1u8], "value");
        let value: serde_json::Value = serde_json::from_str(&to_json(&map)).unwrap();
        assert_eq!(value["error"]["kind"], "internal");
    }
}
