//! ISO 9660 seed-image generator with Joliet and Rock Ridge extensions.
//!
//! # Background
//!
//! ISO 9660 is the 1988-vintage CD-ROM filesystem. Its base format only
//! allows 8.3 uppercase filenames, which cannot represent the lowercase,
//! hyphenated names cloud-init's NoCloud datasource expects (`user-data`,
//! `meta-data`, `network-config`). Two extensions fix that:
//!
//! - **Rock Ridge** hides POSIX names and attributes in per-record "System
//!   Use" areas that plain ISO readers skip. Linux prefers it.
//! - **Joliet** adds a second, parallel directory tree with UCS-2 names
//!   under a Supplementary Volume Descriptor. Some readers (and the
//!   original seed tooling) expect it alongside Rock Ridge.
//!
//! This module emits both trees over a single shared set of file extents.
//! It only supports flat images (files in the root directory) — exactly
//! what a cloud-init seed needs and nothing more.
//!
//! Encoding conventions, once, so the helpers below don't repeat them:
//! every multi-byte number is stored "both-endian" (little-endian copy
//! immediately followed by the big-endian copy), all metadata structures
//! are padded out to full 2048-byte sectors, and each file's data starts
//! on a fresh sector boundary.
//!
//! # Image layout
//!
//! ```text
//! ┌──────────┬──────────────────────────────────────────────────────┐
//! │ Sectors  │ Contents                                             │
//! ├──────────┼──────────────────────────────────────────────────────┤
//! │  0 – 15  │ System Area (all zeros, reserved for boot loaders)   │
//! │    16    │ Primary Volume Descriptor (PVD)                      │
//! │    17    │ Supplementary Volume Descriptor (Joliet)             │
//! │    18    │ Volume Descriptor Set Terminator                     │
//! │    19    │ ISO Path Table (L-type, little-endian)               │
//! │    20    │ ISO Path Table (M-type, big-endian)                  │
//! │    21    │ Joliet Path Table (L-type)                           │
//! │    22    │ Joliet Path Table (M-type)                           │
//! │    23    │ ISO Root Directory (8.3 names + Rock Ridge)          │
//! │    24    │ SUSP Continuation Area (Rock Ridge ER entry)         │
//! │    25    │ Joliet Root Directory (UCS-2 names)                  │
//! │  26+     │ File data (each file starts on a sector boundary)    │
//! └──────────┴──────────────────────────────────────────────────────┘
//! ```
//!
//! # References
//!
//! - ECMA-119 (ISO 9660): <https://ecma-international.org/publications-and-standards/standards/ecma-119/>
//! - Joliet specification (Microsoft, 1995)
//! - SUSP (IEEE P1281) / RRIP (IEEE P1282)

/// Sector ("logical block") size, hardcoded by the spec at 2048 bytes.
const SECTOR_SIZE: usize = 2048;

const ISO_PATH_TABLE_L: u32 = 19;
const ISO_PATH_TABLE_M: u32 = 20;
const JOLIET_PATH_TABLE_L: u32 = 21;
const JOLIET_PATH_TABLE_M: u32 = 22;
const ISO_ROOT_SECTOR: u32 = 23;
const CE_SECTOR: u32 = 24;
const JOLIET_ROOT_SECTOR: u32 = 25;
const FIRST_FILE_SECTOR: usize = 26;

/// A file to include in the image's root directory.
pub struct IsoFile<'a> {
    /// The filename as it should appear to the guest (e.g. `"meta-data"`).
    /// Stored as a Rock Ridge alternate name and as a Joliet UCS-2 name.
    pub name: &'a str,
    /// The file contents (arbitrary bytes).
    pub data: &'a [u8],
}

/// Build a complete ISO 9660 + Joliet + Rock Ridge image in memory.
///
/// `volume_id` must be ASCII, max 32 chars (cloud-init looks for `cidata`,
/// matched case-insensitively).
///
/// # Panics
///
/// Panics if `volume_id` is not ASCII or exceeds 32 characters.
pub fn build_iso(volume_id: &str, files: &[IsoFile<'_>]) -> Vec<u8> {
    assert!(
        volume_id.len() <= 32 && volume_id.is_ascii(),
        "volume_id must be ASCII, max 32 chars"
    );

    // Lay files out on sector boundaries, after all metadata sectors.
    let mut file_layout: Vec<(usize, usize)> = Vec::with_capacity(files.len());
    let mut next_sector = FIRST_FILE_SECTOR;
    for f in files {
        file_layout.push((next_sector, f.data.len()));
        next_sector += sector_count(f.data.len());
    }
    let total_sectors = next_sector;

    let mut iso = vec![0u8; total_sectors * SECTOR_SIZE];

    write_volume_descriptor(
        &mut iso,
        16,
        DescriptorText::Ascii,
        volume_id,
        total_sectors as u32,
        ISO_PATH_TABLE_L,
        ISO_PATH_TABLE_M,
        ISO_ROOT_SECTOR,
    );
    write_volume_descriptor(
        &mut iso,
        17,
        DescriptorText::Ucs2,
        volume_id,
        total_sectors as u32,
        JOLIET_PATH_TABLE_L,
        JOLIET_PATH_TABLE_M,
        JOLIET_ROOT_SECTOR,
    );
    write_terminator(&mut iso);

    write_path_table(&mut iso, ISO_PATH_TABLE_L, ISO_ROOT_SECTOR, Endian::Little);
    write_path_table(&mut iso, ISO_PATH_TABLE_M, ISO_ROOT_SECTOR, Endian::Big);
    write_path_table(
        &mut iso,
        JOLIET_PATH_TABLE_L,
        JOLIET_ROOT_SECTOR,
        Endian::Little,
    );
    write_path_table(&mut iso, JOLIET_PATH_TABLE_M, JOLIET_ROOT_SECTOR, Endian::Big);

    let er_entry = extension_reference();
    write_iso_root_directory(&mut iso, &er_entry, files, &file_layout);

    // The Rock Ridge ER entry is ~240 bytes — too big for the "." record's
    // system use area — so it lives in its own continuation sector, pointed
    // at by a CE entry.
    let ce_start = CE_SECTOR as usize * SECTOR_SIZE;
    iso[ce_start..ce_start + er_entry.len()].copy_from_slice(&er_entry);

    write_joliet_root_directory(&mut iso, files, &file_layout);

    // File contents, shared by both directory trees.
    for (i, f) in files.iter().enumerate() {
        let offset = file_layout[i].0 * SECTOR_SIZE;
        iso[offset..offset + f.data.len()].copy_from_slice(f.data);
    }

    iso
}

// ── volume descriptors ──────────────────────────────────────

/// How a volume descriptor's text fields are encoded. This is the whole
/// difference between the PVD and the Joliet SVD: same field layout,
/// different type code, UCS-2 text, and an escape-sequence tag.
#[derive(Clone, Copy, PartialEq, Eq)]
enum DescriptorText {
    Ascii,
    Ucs2,
}

/// Fill one volume descriptor sector. Field offsets follow ECMA-119 §8.4:
///
/// | Offset | Field                                                 |
/// |--------|-------------------------------------------------------|
/// |   0    | Type (1 = primary, 2 = supplementary)                 |
/// |  1–6   | `"CD001"` magic + version                             |
/// |  8–71  | System + volume identifiers (space-padded text)       |
/// | 80–87  | Volume space size in sectors                          |
/// | 88–120 | Escape sequences — `%/E` marks a Joliet UCS-2 tree    |
/// | 120–131| Set size, sequence number, logical block size         |
/// | 132–151| Path table size and L/M locations                     |
/// | 156–189| Root directory record, embedded inline                |
/// | 190–813| Publisher/preparer/application text (space-padded)    |
/// |  881   | File structure version                                |
fn write_volume_descriptor(
    iso: &mut [u8],
    sector: usize,
    text: DescriptorText,
    volume_id: &str,
    total_sectors: u32,
    path_table_l: u32,
    path_table_m: u32,
    root_extent: u32,
) {
    let desc = &mut iso[sector * SECTOR_SIZE..(sector + 1) * SECTOR_SIZE];

    desc[0] = match text {
        DescriptorText::Ascii => 1,
        DescriptorText::Ucs2 => 2,
    };
    desc[1..6].copy_from_slice(b"CD001");
    desc[6] = 1;

    // System identifier (8..40) stays blank; volume identifier (40..72)
    // carries the label, truncated to the 32-byte field.
    match text {
        DescriptorText::Ascii => {
            desc[8..40].fill(b' ');
            desc[40..72].fill(b' ');
            let label = volume_id.as_bytes();
            desc[40..40 + label.len()].copy_from_slice(label);
        }
        DescriptorText::Ucs2 => {
            fill_ucs2_spaces(&mut desc[8..72]);
            let label = ucs2_be(volume_id);
            let n = label.len().min(32);
            desc[40..40 + n].copy_from_slice(&label[..n]);
        }
    }

    desc[80..88].copy_from_slice(&both_u32(total_sectors));
    if text == DescriptorText::Ucs2 {
        // UCS-2 Level 3 escape sequence; this is what readers sniff to
        // recognize a Joliet tree.
        desc[88..91].copy_from_slice(b"%/E");
    }

    desc[120..124].copy_from_slice(&both_u16(1)); // volume set size
    desc[124..128].copy_from_slice(&both_u16(1)); // volume sequence number
    desc[128..132].copy_from_slice(&both_u16(SECTOR_SIZE as u16));

    // One path table entry (the root), 10 bytes, in both byte orders.
    desc[132..140].copy_from_slice(&both_u32(10));
    desc[140..144].copy_from_slice(&path_table_l.to_le_bytes());
    desc[148..152].copy_from_slice(&path_table_m.to_be_bytes());

    let root = DirRecord {
        extent: root_extent,
        data_len: SECTOR_SIZE as u32,
        ident: b"\x00",
        is_dir: true,
        system_use: &[],
    }
    .encode();
    desc[156..156 + root.len()].copy_from_slice(&root);

    // Publisher, preparer, application, and file identifiers all blank.
    match text {
        DescriptorText::Ascii => desc[190..814].fill(b' '),
        DescriptorText::Ucs2 => fill_ucs2_spaces(&mut desc[190..814]),
    }
    desc[881] = 1; // file structure version
}

/// Close the descriptor sequence with a type-255 terminator at sector 18.
/// Readers scan from sector 16 upward until they hit this.
fn write_terminator(iso: &mut [u8]) {
    let term = &mut iso[18 * SECTOR_SIZE..19 * SECTOR_SIZE];
    term[0] = 255;
    term[1..6].copy_from_slice(b"CD001");
    term[6] = 1;
}

#[derive(Clone, Copy)]
enum Endian {
    Little,
    Big,
}

/// Emit a path table at the given sector.
///
/// Path tables give readers a flat directory index; the spec wants one
/// little-endian (L) and one big-endian (M) copy per tree. With the root
/// as the only directory, a table is a single 10-byte entry: identifier
/// length 1, no extended attributes, the root's extent, parent number 1,
/// and the 0x00 root identifier plus a pad byte. The ISO and Joliet
/// tables differ only in which root extent they name.
fn write_path_table(iso: &mut [u8], sector: u32, root_extent: u32, endian: Endian) {
    let mut entry = Vec::with_capacity(10);
    entry.push(1); // identifier length
    entry.push(0); // extended attribute length
    match endian {
        Endian::Little => {
            entry.extend_from_slice(&root_extent.to_le_bytes());
            entry.extend_from_slice(&1u16.to_le_bytes());
        }
        Endian::Big => {
            entry.extend_from_slice(&root_extent.to_be_bytes());
            entry.extend_from_slice(&1u16.to_be_bytes());
        }
    }
    entry.push(0x00); // root identifier
    entry.push(0x00); // pad to even length

    let at = sector as usize * SECTOR_SIZE;
    iso[at..at + entry.len()].copy_from_slice(&entry);
}

// ── directory records ───────────────────────────────────────

/// One directory record, per ECMA-119 §9.1.
///
/// The encoded form is a 33-byte fixed header (record length, extent and
/// data length in both byte orders, a zeroed timestamp, flags, and the
/// volume sequence number), the identifier, an optional pad byte, and
/// whatever System Use data the caller wants to attach (Rock Ridge
/// entries go there). The pad byte exists because the System Use area
/// must begin at an even offset: the header is 33 bytes, so identifiers
/// of *even* length need one byte of padding.
struct DirRecord<'a> {
    extent: u32,
    data_len: u32,
    ident: &'a [u8],
    is_dir: bool,
    system_use: &'a [u8],
}

impl DirRecord<'_> {
    fn encode(&self) -> Vec<u8> {
        let ident_len = self.ident.len();
        let pad = usize::from(ident_len % 2 == 0);
        let total = 33 + ident_len + pad + self.system_use.len();

        let mut rec = Vec::with_capacity(total);
        rec.push(total as u8); // record length
        rec.push(0); // extended attribute record length
        rec.extend_from_slice(&both_u32(self.extent));
        rec.extend_from_slice(&both_u32(self.data_len));
        rec.extend_from_slice(&[0u8; 7]); // recording date/time
        rec.push(if self.is_dir { 0x02 } else { 0x00 }); // file flags
        rec.push(0); // file unit size
        rec.push(0); // interleave gap size
        rec.extend_from_slice(&both_u16(1)); // volume sequence number
        rec.push(ident_len as u8);
        rec.extend_from_slice(self.ident);
        if pad == 1 {
            rec.push(0);
        }
        rec.extend_from_slice(self.system_use);
        rec
    }
}

/// Copy an encoded record into the directory extent and advance the
/// cursor. Records are packed back to back; the sector's tail stays zero.
fn append_record(iso: &mut [u8], cursor: &mut usize, rec: &[u8]) {
    iso[*cursor..*cursor + rec.len()].copy_from_slice(rec);
    *cursor += rec.len();
}

/// Emit the ISO 9660 root directory with Rock Ridge decoration.
///
/// Record order: `.` first (carrying the SUSP presence marker and a CE
/// pointer to the ER entry parked in the continuation sector), then `..`
/// (the root is its own parent), then one record per file with a mangled
/// 8.3 identifier plus NM (real name) and PX (POSIX attributes) entries.
fn write_iso_root_directory(
    iso: &mut [u8],
    er_entry: &[u8],
    files: &[IsoFile<'_>],
    file_layout: &[(usize, usize)],
) {
    let mut cursor = ISO_ROOT_SECTOR as usize * SECTOR_SIZE;
    let root_size = SECTOR_SIZE as u32;

    let mut dot_su = rock_ridge_marker();
    dot_su.extend_from_slice(&continuation_pointer(CE_SECTOR, 0, er_entry.len() as u32));
    let dot = DirRecord {
        extent: ISO_ROOT_SECTOR,
        data_len: root_size,
        ident: b"\x00",
        is_dir: true,
        system_use: &dot_su,
    }
    .encode();
    append_record(iso, &mut cursor, &dot);

    let dotdot = DirRecord {
        extent: ISO_ROOT_SECTOR,
        data_len: root_size,
        ident: b"\x01",
        is_dir: true,
        system_use: &[],
    }
    .encode();
    append_record(iso, &mut cursor, &dotdot);

    for (i, f) in files.iter().enumerate() {
        let (sector, size) = file_layout[i];
        let short = level1_name(f.name);
        let mut su = alternate_name(f.name);
        su.extend_from_slice(&posix_attributes(0o100644, 1));

        let rec = DirRecord {
            extent: sector as u32,
            data_len: size as u32,
            ident: short.as_bytes(),
            is_dir: false,
            system_use: &su,
        }
        .encode();
        append_record(iso, &mut cursor, &rec);
    }
}

/// Emit the Joliet root directory.
///
/// Same record structure as the ISO tree, but identifiers are the real
/// names in UCS-2 big-endian and no System Use area is needed — Joliet
/// carries long names natively.
fn write_joliet_root_directory(
    iso: &mut [u8],
    files: &[IsoFile<'_>],
    file_layout: &[(usize, usize)],
) {
    let mut cursor = JOLIET_ROOT_SECTOR as usize * SECTOR_SIZE;
    let root_size = SECTOR_SIZE as u32;

    for ident in [b"\x00", b"\x01"] {
        let rec = DirRecord {
            extent: JOLIET_ROOT_SECTOR,
            data_len: root_size,
            ident,
            is_dir: true,
            system_use: &[],
        }
        .encode();
        append_record(iso, &mut cursor, &rec);
    }

    for (i, f) in files.iter().enumerate() {
        let (sector, size) = file_layout[i];
        let name = ucs2_be(f.name);
        let rec = DirRecord {
            extent: sector as u32,
            data_len: size as u32,
            ident: &name,
            is_dir: false,
            system_use: &[],
        }
        .encode();
        append_record(iso, &mut cursor, &rec);
    }
}

// ── SUSP / Rock Ridge entries ───────────────────────────────
//
// Every SUSP entry is framed the same way — a two-character signature, a
// total length, and a version byte, followed by entry-specific data — so
// one framing helper serves all five entry kinds used here:
//
//   SP  presence marker, required in the "." record of each directory
//   CE  pointer to continuation data that didn't fit in the record
//   ER  names the extension in use (RRIP) so readers look for NM/PX
//   NM  the real POSIX filename
//   PX  POSIX mode, link count, uid, gid

/// Frame a SUSP entry: signature, length, version 1, then the body.
fn susp(signature: &[u8; 2], body: &[u8]) -> Vec<u8> {
    let mut entry = Vec::with_capacity(4 + body.len());
    entry.extend_from_slice(signature);
    entry.push((4 + body.len()) as u8);
    entry.push(1);
    entry.extend_from_slice(body);
    entry
}

/// SP entry. The `0xBE 0xEF` check bytes are fixed by SUSP; the trailing
/// zero says no bytes are skipped before later entries.
fn rock_ridge_marker() -> Vec<u8> {
    susp(b"SP", &[0xBE, 0xEF, 0x00])
}

/// CE entry: where the continuation area lives, as (sector, byte offset,
/// length), each in both byte orders.
fn continuation_pointer(sector: u32, offset: u32, length: u32) -> Vec<u8> {
    let mut body = Vec::with_capacity(24);
    for field in [sector, offset, length] {
        body.extend_from_slice(&both_u32(field));
    }
    susp(b"CE", &body)
}

/// ER entry declaring RRIP_1991A. The three strings are mandated verbatim
/// by the Rock Ridge standard; the body leads with their lengths and the
/// extension version.
fn extension_reference() -> Vec<u8> {
    let id: &[u8] = b"RRIP_1991A";
    let descriptor: &[u8] =
        b"THE ROCK RIDGE INTERCHANGE PROTOCOL PROVIDES SUPPORT FOR POSIX FILE SYSTEM SEMANTICS";
    let source: &[u8] = b"PLEASE CONTACT DISC PUBLISHER FOR SPECIFICATION SOURCE.  SEE PUBLISHER IDENTIFIER IN PRIMARY VOLUME DESCRIPTOR FOR CONTACT INFORMATION.";

    let mut body = Vec::with_capacity(4 + id.len() + descriptor.len() + source.len());
    body.push(id.len() as u8);
    body.push(descriptor.len() as u8);
    body.push(source.len() as u8);
    body.push(1); // extension version
    body.extend_from_slice(id);
    body.extend_from_slice(descriptor);
    body.extend_from_slice(source);
    susp(b"ER", &body)
}

/// NM entry carrying the real filename. The leading flags byte is zero:
/// the name is complete in this one entry.
fn alternate_name(name: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(1 + name.len());
    body.push(0);
    body.extend_from_slice(name.as_bytes());
    susp(b"NM", &body)
}

/// PX entry: st_mode and st_nlink in both byte orders, then uid, gid, and
/// the file serial number, all left zero (root:root is fine for a seed).
fn posix_attributes(mode: u32, nlink: u32) -> Vec<u8> {
    let mut body = Vec::with_capacity(40);
    body.extend_from_slice(&both_u32(mode));
    body.extend_from_slice(&both_u32(nlink));
    body.extend_from_slice(&[0u8; 24]);
    susp(b"PX", &body)
}

// ── name encoding ───────────────────────────────────────────

/// Mangle a filename into ISO 9660 Level 1 form: everything outside
/// `[A-Z0-9_.]` becomes an underscore, the stem is clipped to 8 chars and
/// the extension (text after the first dot, if any) to 3, and a `;1`
/// version suffix is appended. Only ISO-unaware readers ever see these —
/// Linux takes the NM entry, Windows the Joliet name.
///
/// Examples:
///   "meta-data"       → "META_DAT;1"
///   "file.txt"        → "FILE.TXT;1"
///   "network-config"  → "NETWORK_;1"
fn level1_name(name: &str) -> String {
    let mapped: String = name
        .chars()
        .map(|c| match c.to_ascii_uppercase() {
            c @ ('A'..='Z' | '0'..='9' | '_' | '.') => c,
            _ => '_',
        })
        .collect();

    match mapped.split_once('.') {
        Some((stem, ext)) => {
            let stem = &stem[..stem.len().min(8)];
            let ext = &ext[..ext.len().min(3)];
            format!("{stem}.{ext};1")
        }
        None => {
            let stem = &mapped[..mapped.len().min(8)];
            format!("{stem};1")
        }
    }
}

/// Encode an ASCII name as UCS-2 big-endian for the Joliet tree.
fn ucs2_be(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2);
    for c in s.chars() {
        let code = c as u32;
        debug_assert!(code <= 0xFFFF, "Joliet names are limited to the BMP");
        out.extend_from_slice(&(code as u16).to_be_bytes());
    }
    out
}

/// Fill a fixed UCS-2 text field with UCS-2 spaces (0x0020).
fn fill_ucs2_spaces(buf: &mut [u8]) {
    for pair in buf.chunks_exact_mut(2) {
        pair[0] = 0x00;
        pair[1] = 0x20;
    }
}

// ── low-level encoding ──────────────────────────────────────

/// Sectors needed for `bytes` of data; even an empty file claims one.
fn sector_count(bytes: usize) -> usize {
    bytes.div_ceil(SECTOR_SIZE).max(1)
}

/// A u32 in both byte orders: four LE bytes then four BE bytes.
fn both_u32(val: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&val.to_le_bytes());
    out[4..].copy_from_slice(&val.to_be_bytes());
    out
}

/// A u16 in both byte orders: two LE bytes then two BE bytes.
fn both_u16(val: u16) -> [u8; 4] {
    let mut out = [0u8; 4];
    out[..2].copy_from_slice(&val.to_le_bytes());
    out[2..].copy_from_slice(&val.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_image() -> Vec<u8> {
        build_iso(
            "cidata",
            &[
                IsoFile {
                    name: "user-data",
                    data: b"#cloud-config\nhostname: web1\n",
                },
                IsoFile {
                    name: "meta-data",
                    data: b"instance-id: i-test\n",
                },
                IsoFile {
                    name: "network-config",
                    data: b"version: 2\n",
                },
            ],
        )
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    fn sector(iso: &[u8], n: u32) -> &[u8] {
        &iso[n as usize * SECTOR_SIZE..(n as usize + 1) * SECTOR_SIZE]
    }

    #[test]
    fn descriptor_chain_is_pvd_svd_terminator() {
        let iso = seed_image();
        for (n, type_code) in [(16, 1u8), (17, 2u8), (18, 255u8)] {
            let desc = sector(&iso, n);
            assert_eq!(desc[0], type_code, "descriptor type at sector {n}");
            assert_eq!(&desc[1..6], b"CD001", "magic at sector {n}");
            assert_eq!(desc[6], 1, "descriptor version at sector {n}");
        }
    }

    #[test]
    fn volume_label_in_both_encodings() {
        let iso = seed_image();
        let pvd = sector(&iso, 16);
        assert_eq!(&pvd[40..46], b"cidata");
        assert_eq!(pvd[46], b' ');

        let svd = sector(&iso, 17);
        assert_eq!(&svd[40..52], &ucs2_be("cidata")[..]);
        assert_eq!(&svd[52..54], &[0x00, 0x20], "label padded with UCS-2 spaces");
    }

    #[test]
    fn svd_carries_joliet_escape_sequence() {
        let iso = seed_image();
        assert_eq!(&sector(&iso, 17)[88..91], b"%/E");
    }

    #[test]
    fn image_is_whole_sectors() {
        let iso = seed_image();
        assert_eq!(iso.len() % SECTOR_SIZE, 0);
    }

    #[test]
    fn file_contents_and_posix_names_are_present() {
        let iso = seed_image();
        // The data extents hold the payloads verbatim...
        for payload in [
            &b"#cloud-config\nhostname: web1\n"[..],
            b"instance-id: i-test\n",
            b"version: 2\n",
        ] {
            assert!(contains(&iso, payload), "payload missing");
        }
        // ...and every real filename appears as a Rock Ridge NM entry.
        for name in ["user-data", "meta-data", "network-config"] {
            assert!(contains(&iso, name.as_bytes()), "NM entry for {name} missing");
        }
    }

    #[test]
    fn joliet_root_lists_ucs2_names_over_shared_extents() {
        let iso = seed_image();
        let root = sector(&iso, JOLIET_ROOT_SECTOR);
        for name in ["user-data", "meta-data", "network-config"] {
            assert!(
                contains(root, &ucs2_be(name)),
                "Joliet identifier for {name} missing"
            );
        }

        // "." and ".." encode to 34 bytes each; the record after them is
        // the first file, whose extent must be the shared data area.
        let first_file = &root[68..];
        let extent = u32::from_le_bytes(first_file[2..6].try_into().unwrap());
        assert_eq!(extent as usize, FIRST_FILE_SECTOR);
    }

    #[test]
    fn rock_ridge_announces_itself() {
        let iso = seed_image();
        // SP marker with its check bytes in the "." record, and the ER
        // identification parked in the continuation sector.
        assert!(contains(&iso, &[b'S', b'P', 7, 1, 0xBE, 0xEF]));
        assert!(contains(sector(&iso, CE_SECTOR), b"RRIP_1991A"));
    }

    #[test]
    fn iso_root_opens_with_the_self_record() {
        let iso = seed_image();
        let root = sector(&iso, ISO_ROOT_SECTOR);
        assert_eq!(root[32], 1, "identifier length of '.'");
        assert_eq!(root[33], 0x00, "'.' identifier byte");
        assert_eq!(root[25] & 0x02, 0x02, "'.' carries the directory flag");
    }

    #[test]
    fn susp_entries_are_framed_with_length_and_version() {
        let nm = alternate_name("user-data");
        assert_eq!(&nm[..2], b"NM");
        assert_eq!(nm[2] as usize, nm.len());
        assert_eq!(nm[3], 1);

        let px = posix_attributes(0o100644, 1);
        assert_eq!(&px[..2], b"PX");
        assert_eq!(px[2], 44);

        let ce = continuation_pointer(24, 0, 237);
        assert_eq!(&ce[..2], b"CE");
        assert_eq!(ce[2], 28);
    }

    #[test]
    fn level1_name_mangling() {
        // Dotless names keep up to eight chars of stem and no extension.
        assert_eq!(level1_name("user-data"), "USER_DAT;1");
        assert_eq!(level1_name("meta-data"), "META_DAT;1");
        assert_eq!(level1_name("network-config"), "NETWORK_;1");
        assert_eq!(level1_name("README"), "README;1");
        // A dot splits into 8.3.
        assert_eq!(level1_name("file.txt"), "FILE.TXT;1");
        assert_eq!(level1_name("longfilename.extension"), "LONGFILE.EXT;1");
    }

    #[test]
    fn empty_file_still_claims_a_sector() {
        let iso = build_iso(
            "TEST",
            &[IsoFile {
                name: "empty",
                data: b"",
            }],
        );
        assert_eq!(iso.len(), (FIRST_FILE_SECTOR + 1) * SECTOR_SIZE);
    }

    #[test]
    fn large_file_occupies_consecutive_sectors() {
        let payload = vec![0xABu8; 5000]; // needs three sectors
        let iso = build_iso(
            "TEST",
            &[IsoFile {
                name: "big.bin",
                data: &payload,
            }],
        );
        assert_eq!(iso.len(), (FIRST_FILE_SECTOR + 3) * SECTOR_SIZE);
        let start = FIRST_FILE_SECTOR * SECTOR_SIZE;
        assert_eq!(&iso[start..start + payload.len()], payload.as_slice());
    }

    #[test]
    fn path_tables_point_to_their_roots() {
        let iso = seed_image();
        let checks = [
            (ISO_PATH_TABLE_L, ISO_ROOT_SECTOR, Endian::Little),
            (ISO_PATH_TABLE_M, ISO_ROOT_SECTOR, Endian::Big),
            (JOLIET_PATH_TABLE_L, JOLIET_ROOT_SECTOR, Endian::Little),
            (JOLIET_PATH_TABLE_M, JOLIET_ROOT_SECTOR, Endian::Big),
        ];
        for (table, root, endian) in checks {
            let entry = sector(&iso, table);
            let raw: [u8; 4] = entry[2..6].try_into().unwrap();
            let extent = match endian {
                Endian::Little => u32::from_le_bytes(raw),
                Endian::Big => u32::from_be_bytes(raw),
            };
            assert_eq!(extent, root, "path table at sector {table}");
        }
    }
}
