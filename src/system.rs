//! System probe and machine identity
//!
//! Captures a normalized [`SystemInfo`] snapshot with per-OS strategies and
//! derives a stable machine fingerprint from it. Probing is best-effort: a
//! field that cannot be determined is an empty string (or zero), never an
//! omitted key, so reports from partially-probed machines stay comparable.
//!
//! Every external command is bounded by a 2-second deadline; a command that
//! overruns is killed and contributes an empty string.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Deadline for each external probe command
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Snapshot of the probed machine. Immutable after capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    /// Normalized CPU architecture (`x86_64`, `arm64`, or passthrough)
    pub architecture: String,
    /// OS kind (`linux`, `macos`, `windows`, …)
    pub os: String,
    /// Human-readable OS version, e.g. "Ubuntu 22.04.4 LTS"
    pub os_version: String,
    /// CPU model string, single line
    pub cpu_model: String,
    /// Primary GPU model string, single line
    pub gpu_model: String,
    /// Device (laptop/desktop) model where available
    pub device_model: String,
    /// Total RAM in bytes
    pub ram_bytes: u64,
    /// Detailed GPU adapter records, when enumeration is available
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gpus: Vec<BTreeMap<String, String>>,
}

impl SystemInfo {
    /// Pretty JSON rendering for the `info` CLI command.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// Probe the current machine.
///
/// Never fails; individual fields degrade to empty values.
#[must_use]
pub fn collect() -> SystemInfo {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    sys.refresh_cpu_all();

    let mut info = SystemInfo {
        architecture: normalize_arch(env::consts::ARCH),
        os: env::consts::OS.to_string(),
        os_version: String::new(),
        cpu_model: String::new(),
        gpu_model: String::new(),
        device_model: String::new(),
        ram_bytes: sys.total_memory(),
        gpus: Vec::new(),
    };

    let cpu_brand = sys
        .cpus()
        .first()
        .map(|c| c.brand().to_string())
        .unwrap_or_default();

    match env::consts::OS {
        "linux" => collect_linux(&mut info, &cpu_brand),
        "macos" => collect_macos(&mut info, &cpu_brand),
        "windows" => collect_windows(&mut info),
        _ => {
            info.os_version = run_one("uname", &["-sr"]);
            info.cpu_model = cpu_brand;
        }
    }

    info.os_version = compact_one_line(&info.os_version);
    info.cpu_model = compact_one_line(&info.cpu_model);
    info.gpu_model = compact_one_line(&info.gpu_model);
    info.device_model = compact_one_line(&info.device_model);
    info
}

/// Stable hex fingerprint of a [`SystemInfo`] snapshot.
///
/// The canonical form lowercases the CPU and GPU model strings before JSON
/// encoding, so vendor-capitalization differences across driver versions do
/// not fork the identity. MD5 here is a fingerprint, not a security boundary.
#[must_use]
pub fn machine_id(info: &SystemInfo) -> String {
    let mut canon = info.clone();
    canon.cpu_model = canon.cpu_model.to_lowercase();
    canon.gpu_model = canon.gpu_model.to_lowercase();
    let bytes = serde_json::to_vec(&canon).unwrap_or_default();
    format!("{:x}", md5::compute(bytes))
}

/// Normalize an architecture label to the report vocabulary.
#[must_use]
pub fn normalize_arch(arch: &str) -> String {
    match arch {
        "amd64" | "x86_64" => "x86_64".to_string(),
        "aarch64" | "arm64" => "arm64".to_string(),
        other => other.to_string(),
    }
}

fn collect_linux(info: &mut SystemInfo, cpu_brand: &str) {
    info.os_version = first_non_empty(&[
        os_release_pretty_name(),
        run_one("lsb_release", &["-ds"]),
        run_one("uname", &["-sr"]),
    ]);

    info.cpu_model = first_non_empty(&[
        cpu_brand.to_string(),
        proc_cpuinfo_model(),
        sh("lscpu | awk -F: '/Model name/ {print $2}'"),
    ]);

    info.gpu_model = first_non_empty(&[
        sh("lspci -nn | grep -Ei 'vga|3d|display' | sed -E 's/.*: //g' | head -n1"),
        sh("glxinfo -B 2>/dev/null | awk -F: '/Device:/{sub(/^[ \\t]+/,\"\",$2);print $2; exit}'"),
    ]);

    let vendor = read_trimmed("/sys/devices/virtual/dmi/id/sys_vendor");
    let model = read_trimmed("/sys/devices/virtual/dmi/id/product_name");
    if !vendor.is_empty() || !model.is_empty() {
        info.device_model = format!("{vendor} {model}").trim().to_string();
    }
}

fn collect_macos(info: &mut SystemInfo, cpu_brand: &str) {
    let name = run_one("sw_vers", &["-productName"]);
    let ver = run_one("sw_vers", &["-productVersion"]);
    info.os_version = if name.is_empty() && ver.is_empty() {
        "macOS".to_string()
    } else {
        format!("{name} {ver}").trim().to_string()
    };

    if info.ram_bytes == 0 {
        info.ram_bytes = run_one("sysctl", &["-n", "hw.memsize"]).parse().unwrap_or(0);
    }

    info.cpu_model = first_non_empty(&[
        cpu_brand.to_string(),
        run_one("sysctl", &["-n", "machdep.cpu.brand_string"]),
    ]);

    // JSON output first (newer macOS), text fallback
    let json_gpu = sh(
        "system_profiler SPDisplaysDataType -json 2>/dev/null | \
         jq -r '.\"SPDisplaysDataType\"[0].\"spdisplays_videoprocessors\"[0] // empty'",
    );
    info.gpu_model = if json_gpu.is_empty() {
        sh("system_profiler SPDisplaysDataType | awk -F: '/Chipset Model:/{sub(/^[ \\t]+/,\"\",$2);print $2; exit}'")
    } else {
        json_gpu
    };

    info.device_model = first_non_empty(&[
        run_one("sysctl", &["-n", "hw.model"]),
        sh("system_profiler SPHardwareDataType | awk -F: '/Model Identifier/{sub(/^[ \\t]+/,\"\",$2);print $2; exit}'"),
    ]);
}

fn collect_windows(info: &mut SystemInfo) {
    let caption = first_line_clean(&run_one("wmic", &["os", "get", "Caption"]));
    let version = first_line_clean(&run_one("wmic", &["os", "get", "Version"]));
    info.os_version = if caption.is_empty() && version.is_empty() {
        let ps_cap = run_one(
            "powershell",
            &[
                "-NoProfile",
                "(Get-CimInstance Win32_OperatingSystem) | Select-Object -ExpandProperty Caption",
            ],
        );
        if ps_cap.is_empty() {
            "Windows".to_string()
        } else {
            let ps_ver = run_one(
                "powershell",
                &[
                    "-NoProfile",
                    "(Get-CimInstance Win32_OperatingSystem) | Select-Object -ExpandProperty Version",
                ],
            );
            format!("{ps_cap} {ps_ver}").trim().to_string()
        }
    } else {
        format!("{caption} {version}").trim().to_string()
    };

    if info.ram_bytes == 0 {
        info.ram_bytes = windows_total_ram();
    }

    info.cpu_model = first_non_empty(&[
        first_line_clean(&run_one("wmic", &["cpu", "get", "Name"])),
        first_line_clean(&run_one(
            "powershell",
            &[
                "-NoProfile",
                "Get-CimInstance Win32_Processor | Select-Object -ExpandProperty Name",
            ],
        )),
    ]);

    info.gpu_model = first_non_empty(&[
        first_line_clean(&run_one(
            "wmic",
            &["path", "win32_VideoController", "get", "Name"],
        )),
        first_line_clean(&run_one(
            "powershell",
            &[
                "-NoProfile",
                "Get-CimInstance Win32_VideoController | Select-Object -ExpandProperty Name",
            ],
        )),
    ]);

    info.device_model = first_non_empty(&[
        run_one("wmic", &["computersystem", "get", "Manufacturer,Model"]),
        run_one(
            "powershell",
            &[
                "-NoProfile",
                "Get-CimInstance Win32_ComputerSystem | Select-Object Manufacturer,Model | Format-Table -HideTableHeaders",
            ],
        ),
    ]);
    info.device_model = first_line_clean(&info.device_model);
}

// WMIC reports KB for TotalVisibleMemorySize; PowerShell fallback is bytes.
fn windows_total_ram() -> u64 {
    let out = run_one("wmic", &["OS", "get", "TotalVisibleMemorySize", "/Value"]);
    for line in out.lines() {
        if let Some(kb) = line.trim().strip_prefix("TotalVisibleMemorySize=") {
            if let Ok(kb) = kb.trim().parse::<u64>() {
                return kb * 1024;
            }
        }
    }
    run_one(
        "powershell",
        &[
            "-NoProfile",
            "(Get-CimInstance Win32_ComputerSystem).TotalPhysicalMemory",
        ],
    )
    .parse()
    .unwrap_or(0)
}

fn os_release_pretty_name() -> String {
    let Ok(body) = fs::read_to_string("/etc/os-release") else {
        return String::new();
    };
    for line in body.lines() {
        if let Some(v) = line.strip_prefix("PRETTY_NAME=") {
            return v.trim_matches('"').to_string();
        }
    }
    String::new()
}

fn proc_cpuinfo_model() -> String {
    let Ok(body) = fs::read_to_string("/proc/cpuinfo") else {
        return String::new();
    };
    for line in body.lines() {
        if line.to_lowercase().contains("model name") {
            if let Some(idx) = line.find(':') {
                return line[idx + 1..].trim().to_string();
            }
        }
    }
    String::new()
}

fn read_trimmed(path: &str) -> String {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Run one probe command under the global deadline; empty string on any
/// failure, non-zero exit, or timeout.
fn run_one(program: &str, args: &[&str]) -> String {
    let spawned = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn();
    let Ok(mut child) = spawned else {
        return String::new();
    };

    let deadline = Instant::now() + COMMAND_TIMEOUT;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                if !status.success() {
                    return String::new();
                }
                break;
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return String::new();
                }
                thread::sleep(Duration::from_millis(10));
            }
            Err(_) => return String::new(),
        }
    }

    let mut out = String::new();
    if let Some(mut stdout) = child.stdout.take() {
        let _ = stdout.read_to_string(&mut out);
    }
    out.trim().to_string()
}

/// Run a shell pipeline under the global deadline.
fn sh(pipeline: &str) -> String {
    run_one("sh", &["-c", pipeline])
}

fn first_non_empty(vals: &[String]) -> String {
    vals.iter()
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// First data line of tabular command output, skipping header rows.
fn first_line_clean(s: &str) -> String {
    for line in s.replace('\r', "\n").lines() {
        let line = line.trim();
        let lower = line.to_lowercase();
        if !line.is_empty() && !lower.contains("name") && !lower.contains("manufacturer") {
            return line.to_string();
        }
    }
    s.trim().to_string()
}

fn compact_one_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
