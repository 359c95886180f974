fn main() {
    // ── macOS: embed Info.plist so the `shio` binary may use Bluetooth ────────
    //
    // CoreBluetooth keeps a CLI tool "unauthorised" (scans silently return
    // nothing) unless the executable carries an Info.plist with
    // NSBluetoothAlwaysUsageDescription.  The plist is placed in the
    //   __TEXT,__info_plist
    // section of the Mach-O binary with the linker `-sectcreate` flag.
    //
    // `CARGO_CFG_TARGET_OS` is the target OS, so cross builds work as well.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("macos") {
        return;
    }
    let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") else {
        println!("cargo:warning=CARGO_MANIFEST_DIR not set, Info.plist not embedded");
        return;
    };

    for arg in [
        "-sectcreate".to_owned(),
        "__TEXT".to_owned(),
        "__info_plist".to_owned(),
        format!("{dir}/Info.plist"),
    ] {
        println!("cargo:rustc-link-arg-bin=shio={arg}");
    }
    println!("cargo:rerun-if-changed=Info.plist");
}
