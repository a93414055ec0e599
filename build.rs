//! Build script for ddisplay.
//!
//! Reports the enabled backends and points at the diagnostics switches.

use std::env;

fn main() {
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_GPU_VULKAN");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_PARKING_LOT");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_DIAGNOSTICS");
    println!("cargo:rerun-if-env-changed=DDISPLAY_STRICT");

    let vulkan_enabled = env::var("CARGO_FEATURE_GPU_VULKAN").is_ok();
    let parking_lot_enabled = env::var("CARGO_FEATURE_PARKING_LOT").is_ok();
    let diagnostics_enabled = env::var("CARGO_FEATURE_DIAGNOSTICS").is_ok();

    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    let is_release = profile == "release";

    // =========================================================================
    // Backends
    // =========================================================================

    if vulkan_enabled {
        emit_info("Vulkan backend enabled");
        emit_note("The device needs VK_KHR_display, VK_KHR_swapchain, VK_KHR_device_group,");
        emit_note("timeline semaphores and synchronization2.");
        check_target_platform();
    } else if !is_release {
        emit_note("Only the in-memory dummy device is built. Enable real hardware with:");
        emit_note("  ddisplay = { version = \"0.1\", features = [\"gpu-vulkan\"] }");
    }

    if parking_lot_enabled {
        emit_info("Using parking_lot for mutexes and condition variables");
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    if diagnostics_enabled && is_release {
        emit_info("DD diagnostics are printed in release builds");
    }
    if env::var("DDISPLAY_STRICT").is_ok() {
        emit_warning("DDISPLAY_STRICT is set: warnings fail at runtime when strict mode reads it");
    }
}

// =============================================================================
// Diagnostic emission helpers
// =============================================================================

fn emit_info(msg: &str) {
    println!("cargo:warning=[ddisplay] {}", msg);
}

fn emit_note(msg: &str) {
    println!("cargo:warning=[ddisplay]    {}", msg);
}

fn emit_warning(msg: &str) {
    println!("cargo:warning=[ddisplay] warning: {}", msg);
}

fn check_target_platform() {
    let target = env::var("TARGET").unwrap_or_default();
    if target.contains("darwin") || target.contains("ios") {
        emit_warning("direct display surfaces are not available on Apple platforms");
    } else if target.contains("wasm") {
        emit_warning("the Vulkan backend cannot run on WebAssembly");
    }
}
