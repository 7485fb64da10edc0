#![cfg_attr(target_os = "uefi", no_std)]
#![cfg_attr(target_os = "uefi", no_main)]

#[cfg(target_os = "uefi")]
use ember_boot::{
    config::{BootEntry, BOOT_ENTRIES},
    efi::{EfiConfigTables, EfiFirmware, EfiGraphics, EfiVolume},
    handoff::{Aborted, BootAttempt, InfoAssembled},
    ui, BootError,
};
#[cfg(target_os = "uefi")]
use uefi::prelude::*;

/// Entry point for UEFI firmware
#[cfg(target_os = "uefi")]
#[entry]
fn efi_main(image: Handle, mut st: SystemTable<Boot>) -> Status {
    // Logger, allocator and panic handler. All three switch themselves off
    // when ExitBootServices signals its event group.
    if uefi_services::init(&mut st).is_err() {
        return Status::LOAD_ERROR;
    }
    if !cfg!(feature = "logging") {
        log::set_max_level(log::LevelFilter::Off);
    }

    ui::draw_boot_banner(&mut st);
    log::info!("Ember loader started, {} boot entries", BOOT_ENTRIES.len());

    // SAFETY: the clone serves console output and protocol lookups only, and
    // none of those happen once the memory map has been captured.
    let mut console = unsafe { st.unsafe_clone() };
    let mut attempt = BootAttempt::new(EfiFirmware::new(image, st));
    let mut last_error = BootError::DeviceUnavailable("no boot entries configured");

    for entry in BOOT_ENTRIES {
        ui::show_entry(&mut console, entry);

        match prepare(attempt, &console, image, entry).and_then(InfoAssembled::capture_map) {
            Ok(captured) => match captured.exit_boot_services() {
                Ok(exited) => exited.normalize_memory_map().dispatch(),
                Err(failure) => failure.halt(),
            },
            Err(aborted) => {
                last_error = aborted.error();
                ui::display_failure(&mut console, entry, &last_error);
                attempt = aborted.restart();
            }
        }
    }

    ui::display_exhausted(&mut console);
    last_error.into()
}

/// Run an entry up to `InfoAssembled`. Protocols opened here are closed again
/// before the memory map is captured.
#[cfg(target_os = "uefi")]
fn prepare(
    attempt: BootAttempt<EfiFirmware>,
    st: &SystemTable<Boot>,
    image: Handle,
    entry: &BootEntry,
) -> Result<InfoAssembled<EfiFirmware>, Aborted<EfiFirmware>> {
    let bs = st.boot_services();

    let mut volume = match EfiVolume::open(bs, image) {
        Ok(volume) => volume,
        Err(e) => return Err(attempt.abort(e)),
    };
    let mut display = match EfiGraphics::open(bs, image) {
        Ok(display) => display,
        Err(e) => return Err(attempt.abort(e)),
    };
    let tables = EfiConfigTables::new(st);

    attempt
        .load_image(&mut volume, entry.path)
        .and_then(|loaded| loaded.assemble_info(&tables, &mut display, entry.cmdline.as_bytes()))
}

#[cfg(not(target_os = "uefi"))]
fn main() {
    eprintln!("ember_boot is a UEFI application; build it for x86_64-unknown-uefi");
}
