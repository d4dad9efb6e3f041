//! Standalone shell script emission
//!
//! [`ScriptWriter`] is an [`Executor`] that renders each invocation as a
//! shell line instead of running it. The pipeline drives it exactly as it
//! drives the host runner, so the emitted script issues the same commands
//! with the same arguments. Cleanup state lives in shell variables updated
//! from the acquire/release hooks, and an EXIT trap tears down from them.

use crate::cleanup::release_invocation;
use crate::config::DiskConfig;
use crate::disk::layouts::ImageLayout;
use crate::provision::pipeline::{BuildTarget, Pipeline};
use crate::provision::tracker::Resource;
use crate::utils::command::{placeholder, CommandOutput, Executor, Invocation};
use crate::utils::error::Result;
use std::cell::RefCell;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

const ROOTFS_VAR: &str = "ROOTFS_DIR";
const IMAGE_VAR: &str = "IMAGE_PATH";
const MOUNT_BASE_VAR: &str = "MOUNT_BASE";

/// Characters that never need quoting
fn is_plain(c: char) -> bool {
    c.is_ascii_alphanumeric() || "_./:=%+,@-".contains(c)
}

/// Quote one word for POSIX sh. Words holding a variable reference are
/// double-quoted so the reference still expands.
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty() && word.chars().all(is_plain) {
        return word.to_string();
    }
    if word.contains('$') {
        let mut quoted = String::with_capacity(word.len() + 2);
        quoted.push('"');
        for c in word.chars() {
            if matches!(c, '"' | '\\' | '`') {
                quoted.push('\\');
            }
            quoted.push(c);
        }
        quoted.push('"');
        return quoted;
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

fn render_command(inv: &Invocation) -> String {
    let mut words = vec![shell_quote(&inv.program)];
    words.extend(inv.args.iter().map(|a| shell_quote(a)));
    let mut line = words.join(" ");

    if let Some(input) = &inv.stdin {
        let lines: Vec<String> = input
            .strip_suffix('\n')
            .unwrap_or(input)
            .split('\n')
            .map(|l| format!("'{}'", l.replace('\'', r"'\''")))
            .collect();
        line = format!("printf '%s\\n' {} | {}", lines.join(" "), line);
    }
    if let Some(var) = inv.bind {
        line = format!("{}=$({})", var, line);
    }
    if inv.best_effort {
        line.push_str(" || true");
    }
    line
}

/// Renders the pipeline as a shell script body
#[derive(Debug, Default)]
pub struct ScriptWriter {
    lines: RefCell<Vec<String>>,
    invocations: RefCell<Vec<Invocation>>,
}

impl ScriptWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, line: String) {
        self.lines.borrow_mut().push(line);
    }

    pub fn body(&self) -> Vec<String> {
        self.lines.borrow().clone()
    }

    /// Invocations in the order they were rendered
    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.borrow().clone()
    }
}

impl Executor for ScriptWriter {
    fn execute(&self, inv: &Invocation) -> Result<CommandOutput> {
        self.invocations.borrow_mut().push(inv.clone());
        self.push(render_command(inv));
        Ok(CommandOutput::with_stdout(
            inv.bind.map(placeholder).unwrap_or_default(),
        ))
    }

    fn file_exists(&self, _path: &Path) -> std::io::Result<bool> {
        Ok(true)
    }

    fn pause(&self, duration: Duration) {
        self.push(format!("sleep {}", duration.as_secs().max(1)));
    }

    fn wait_for_nodes(&self, nodes: &[String], settle: Duration) -> Result<()> {
        self.pause(settle);
        for node in nodes {
            self.push(format!(
                "[ -e {node} ] || {{ echo {msg} >&2; exit 1; }}",
                node = shell_quote(node),
                msg = shell_quote(&format!("Error: partition device {} not created", node)),
            ));
        }
        Ok(())
    }

    fn note(&self, message: &str) {
        self.push(String::new());
        self.push(format!("echo {}", shell_quote(&format!("=== {} ===", message))));
    }

    fn acquired(&self, resource: &Resource) {
        match resource {
            Resource::Mount(path) => {
                self.push(format!("MOUNTED={}", shell_quote(&format!("{} $MOUNTED", path))))
            }
            Resource::VolumeGroup(vg) => self.push(format!("VG_ACTIVE={}", shell_quote(vg))),
            Resource::CryptMapping { name, .. } => {
                self.push(format!("CRYPT_OPEN={}", shell_quote(name)))
            }
            Resource::MountBase(_) => self.push("MOUNT_BASE_CREATED=1".to_string()),
            // LOOP_DEVICE is bound by the attach itself
            Resource::LoopDevice(_) | Resource::ImageFile(_) | Resource::Partitions(_) => {}
        }
    }

    fn released(&self, resource: &Resource) {
        if let Resource::LoopDevice(_) = resource {
            self.push("LOOP_DEVICE=".to_string());
        }
    }
}

/// The EXIT trap: the same release commands teardown issues, driven by the
/// state variables.
fn cleanup_function() -> Vec<String> {
    let guarded = |var: &str, resource: Resource| -> String {
        let inv = release_invocation(&resource).map(|i| render_command(&i)).unwrap_or_default();
        format!("    if [ -n \"${}\" ]; then {}; fi", var, inv)
    };

    let mut lines = vec![
        "cleanup() {".to_string(),
        "    status=$?".to_string(),
        "    set +e".to_string(),
        "    trap - EXIT".to_string(),
        "    echo '=== Cleaning up ==='".to_string(),
        "    for mp in $MOUNTED; do".to_string(),
        format!(
            "        {}",
            render_command(&crate::cleanup::umount_invocation("$mp"))
        ),
        "    done".to_string(),
    ];
    lines.push(guarded(
        "MOUNT_BASE_CREATED",
        Resource::MountBase(placeholder(MOUNT_BASE_VAR)),
    ));
    lines.push(guarded("VG_ACTIVE", Resource::VolumeGroup("$VG_ACTIVE".to_string())));
    lines.push(guarded(
        "CRYPT_OPEN",
        Resource::CryptMapping {
            name: "$CRYPT_OPEN".to_string(),
            device: String::new(),
        },
    ));
    lines.push(guarded("LOOP_DEVICE", Resource::LoopDevice(placeholder("LOOP_DEVICE"))));
    lines.push("    exit $status".to_string());
    lines.push("}".to_string());
    lines
}

/// Render the complete script for a configuration.
pub fn render_script(config: &DiskConfig, layout: &ImageLayout) -> Result<String> {
    let target = BuildTarget {
        image_path: placeholder(IMAGE_VAR),
        rootfs_dir: Some(placeholder(ROOTFS_VAR)),
        mount_base: placeholder(MOUNT_BASE_VAR),
    };
    let writer = ScriptWriter::new();
    let mut pipeline = Pipeline::new(&writer, config, layout, &target);
    pipeline.run()?;

    let script_name = script_file_name(&config.vg_name);
    let mut out = vec![
        "#!/bin/sh".to_string(),
        "# LVM + LUKS disk image creation script".to_string(),
        format!("# Generated by lvmrootfs {}", env!("CARGO_PKG_VERSION")),
        "#".to_string(),
        format!("# Usage: sudo ./{} <rootfs_dir> <output_image>", script_name),
        String::new(),
        "set -eu".to_string(),
        String::new(),
        "if [ \"$#\" -ne 2 ]; then".to_string(),
        "    echo \"Usage: $0 <rootfs_dir> <output_image>\" >&2".to_string(),
        "    exit 2".to_string(),
        "fi".to_string(),
        format!("{}=\"$1\"", ROOTFS_VAR),
        format!("{}=\"$2\"", IMAGE_VAR),
        format!("if [ ! -d {} ]; then", shell_quote(&placeholder(ROOTFS_VAR))),
        format!(
            "    echo {} >&2",
            shell_quote(&format!("Error: rootfs directory not found: {}", placeholder(ROOTFS_VAR)))
        ),
        "    exit 1".to_string(),
        "fi".to_string(),
        String::new(),
        format!("{}=\"/tmp/lvmrootfs-mnt-$$\"", MOUNT_BASE_VAR),
        "MOUNTED=".to_string(),
        "MOUNT_BASE_CREATED=".to_string(),
        "VG_ACTIVE=".to_string(),
        "CRYPT_OPEN=".to_string(),
        "LOOP_DEVICE=".to_string(),
        String::new(),
    ];
    out.extend(cleanup_function());
    out.push(String::new());
    out.push("trap cleanup EXIT".to_string());
    out.push("trap 'exit 130' INT TERM".to_string());
    out.push(String::new());
    out.push(format!("echo '=== LVM disk image: VG {} ==='", config.vg_name));
    out.push(format!(
        "echo 'Total size: {} MiB, LUKS2 ({})'",
        layout.total_mib,
        if config.luks_enabled { "passphrase" } else { "empty credential" }
    ));
    out.extend(writer.body());
    out.push(String::new());
    out.push(format!(
        "echo {}",
        shell_quote(&format!("=== Disk image complete: {} ===", placeholder(IMAGE_VAR)))
    ));
    out.push(String::new());

    Ok(out.join("\n"))
}

pub fn script_file_name(vg_name: &str) -> String {
    format!("create-lvm-{}.sh", vg_name)
}

/// Write the script into `output_dir`, executable by the owner only (it may
/// contain the passphrase).
pub fn emit_script(config: &DiskConfig, layout: &ImageLayout, output_dir: &Path) -> Result<PathBuf> {
    let script = render_script(config, layout)?;

    fs::create_dir_all(output_dir)?;
    let path = output_dir.join(script_file_name(&config.vg_name));
    fs::write(&path, script)?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o700))?;

    info!("Script written to {}", path.display());
    Ok(path)
}
