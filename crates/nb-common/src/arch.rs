/// OUI prefixes assigned to the Raspberry Pi Foundation / Raspberry Pi Ltd.
const RASPBERRY_PI_OUIS: [&str; 5] = ["b8:27:eb", "dc:a6:32", "e4:5f:01", "28:cd:c1", "d8:3a:dd"];

/// Whether the MAC belongs to a Raspberry Pi, which must chainload `snp.efi`.
pub fn is_raspberry_pi(mac: &str) -> bool {
    let mac = mac.to_lowercase().replace('-', ":");
    RASPBERRY_PI_OUIS.iter().any(|oui| mac.starts_with(oui))
}

/// Default iPXE binary handed to a client of this architecture.
pub fn default_boot_file(mac: &str) -> &'static str {
    if is_raspberry_pi(mac) {
        "snp.efi"
    } else {
        "ipxe.efi"
    }
}
