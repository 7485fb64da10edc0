//! Ember Boot UI: banner and failure display on the firmware text console.
//!
//! Everything here runs strictly before the memory map is captured; console
//! output may allocate and would invalidate the map key.

use core::fmt::Write;

use uefi::proto::console::text::Color;
use uefi::table::{Boot, SystemTable};

use crate::config::BootEntry;
use crate::error::BootError;

/// Clear the console and draw the loader banner.
pub fn draw_boot_banner(st: &mut SystemTable<Boot>) {
    let con_out = st.stdout();

    let _ = con_out.reset(false);
    let _ = con_out.set_color(Color::LightCyan, Color::Black);
    let _ = con_out.clear();

    let banner = [
        "\r\n",
        "    +--------------------------------------------------+\r\n",
        "    |        EMBER :: stage-0 ELF64 kernel loader      |\r\n",
        "    +--------------------------------------------------+\r\n",
        "\r\n",
    ];
    for line in banner {
        let _ = con_out.write_str(line);
    }

    let _ = con_out.set_color(Color::White, Color::Black);
}

/// One line per boot entry as it is tried.
pub fn show_entry(st: &mut SystemTable<Boot>, entry: &BootEntry) {
    let con_out = st.stdout();

    let _ = con_out.set_color(Color::Gray, Color::Black);
    let _ = write!(con_out, "  [>] {} :: {}\r\n", entry.name, entry.path);
    let _ = con_out.set_color(Color::White, Color::Black);
}

/// Red failure block naming the entry and why it was abandoned.
pub fn display_failure(st: &mut SystemTable<Boot>, entry: &BootEntry, error: &BootError) {
    let con_out = st.stdout();

    let _ = con_out.set_color(Color::Red, Color::Black);
    let _ = write!(con_out, "\r\n-------------------- {} --------------------\r\n", error.heading());
    let _ = write!(con_out, "[!] {}: {}\r\n", entry.name, error);
    let _ = con_out.write_str("------------------------------------------------------------\r\n");
    let _ = con_out.set_color(Color::White, Color::Black);
}

/// Every entry failed; control goes back to the firmware boot manager.
pub fn display_exhausted(st: &mut SystemTable<Boot>) {
    let con_out = st.stdout();

    let _ = con_out.set_color(Color::Yellow, Color::Black);
    let _ = con_out.write_str("[warn] no bootable entry left, returning to firmware\r\n");
    let _ = con_out.set_color(Color::White, Color::Black);
}
