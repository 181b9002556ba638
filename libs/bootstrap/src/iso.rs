//! A minimal ISO 9660 (level 1, no Rock Ridge/Joliet) writer: a flat root
//! directory holding a handful of files, each stored as one contiguous
//! extent. Sufficient for a cloud-init "cidata"/"config-2" style config
//! drive or an Ignition `config.ign` ISO; nothing more is needed since
//! bootstrap-data generation itself is out of scope (§1), only attachment.

use crate::error::Result;

const SECTOR: usize = 2048;

struct PreparedFile {
    iso_name: String,
    data: Vec<u8>,
}

fn pad_to_sector(buf: &mut Vec<u8>) {
    let remainder = buf.len() % SECTOR;
    if remainder != 0 {
        buf.resize(buf.len() + (SECTOR - remainder), 0);
    }
}

fn iso_name(name: &str, index: usize) -> String {
    // ISO 9660 level 1: 8.3 uppercase names plus a mandatory ";1" version
    // suffix. Config-drive tooling is tolerant of this, so no fallback to a
    // generated short name is needed beyond a deterministic `Fn` suffix.
    let upper = name.to_uppercase().replace('.', "_");
    let truncated: String = upper.chars().take(8).collect();
    format!("{truncated}{index}.DAT;1")
}

fn both_endian_u32(value: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&value.to_le_bytes());
    out[4..8].copy_from_slice(&value.to_be_bytes());
    out
}

fn both_endian_u16(value: u16) -> [u8; 4] {
    let mut out = [0u8; 4];
    out[0..2].copy_from_slice(&value.to_le_bytes());
    out[2..4].copy_from_slice(&value.to_be_bytes());
    out
}

fn directory_record(name: &str, extent_lba: u32, size: u32, is_dir: bool, self_or_parent: Option<u8>) -> Vec<u8> {
    let name_bytes: Vec<u8> = match self_or_parent {
        Some(b) => vec![b],
        None => name.as_bytes().to_vec(),
    };
    let name_len = name_bytes.len() as u8;
    // Directory record length must be even; pad with one byte if needed.
    let pad = if (33 + name_len as usize) % 2 == 1 { 1 } else { 0 };
    let record_len = 33 + name_len as usize + pad;

    let mut record = Vec::with_capacity(record_len);
    record.push(record_len as u8);
    record.push(0); // extended attribute record length
    record.extend_from_slice(&both_endian_u32(extent_lba));
    record.extend_from_slice(&both_endian_u32(size));
    record.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0]); // recording date/time (unset, deterministic output)
    record.push(if is_dir { 0x02 } else { 0x00 }); // file flags
    record.push(0); // file unit size
    record.push(0); // interleave gap size
    record.extend_from_slice(&both_endian_u16(1)); // volume sequence number
    record.push(name_len);
    record.extend_from_slice(&name_bytes);
    if pad == 1 {
        record.push(0);
    }
    record
}

/// Build a minimal ISO 9660 image containing `files` (name, contents) at the
/// root, labeled with `volume_id` (e.g. `"cidata"` or `"ignition"`).
///
/// Deterministic: given the same `volume_id` and `files`, the output bytes
/// are identical across invocations (no timestamps are embedded).
pub fn build_iso(volume_id: &str, files: &[(String, Vec<u8>)]) -> Result<Vec<u8>> {
    let prepared: Vec<PreparedFile> = files
        .iter()
        .enumerate()
        .map(|(i, (name, data))| PreparedFile {
            iso_name: iso_name(name, i),
            data: data.clone(),
        })
        .collect();

    // Layout: 16 system sectors, PVD (17), terminator (18), root directory
    // extent (19), then each file's contiguous extent in order.
    const PVD_LBA: u32 = 16;
    const TERMINATOR_LBA: u32 = 17;
    const ROOT_DIR_LBA: u32 = 18;

    let mut root_dir = Vec::new();
    root_dir.extend(directory_record(".", ROOT_DIR_LBA, SECTOR as u32, true, Some(0)));
    root_dir.extend(directory_record("..", ROOT_DIR_LBA, SECTOR as u32, true, Some(1)));

    let mut next_lba = ROOT_DIR_LBA + 1;
    let mut file_records = Vec::new();
    for file in &prepared {
        let extent_sectors = file.data.len().div_ceil(SECTOR).max(1) as u32;
        file_records.push((file, next_lba, file.data.len() as u32));
        next_lba += extent_sectors;
    }
    for (file, lba, size) in &file_records {
        root_dir.extend(directory_record(&file.iso_name, *lba, *size, false, None));
    }
    pad_to_sector(&mut root_dir);
    let root_dir_sectors = (root_dir.len() / SECTOR) as u32;
    let total_sectors = next_lba + (root_dir_sectors - 1);

    let mut pvd = vec![0u8; SECTOR];
    pvd[0] = 1; // volume descriptor type: primary
    pvd[1..6].copy_from_slice(b"CD001");
    pvd[6] = 1; // version
    let vol_id_field = &mut pvd[40..72];
    let vol_id_bytes = volume_id.to_uppercase();
    let copy_len = vol_id_bytes.len().min(32);
    vol_id_field[..copy_len].copy_from_slice(&vol_id_bytes.as_bytes()[..copy_len]);
    for byte in vol_id_field[copy_len..].iter_mut() {
        *byte = b' ';
    }
    pvd[80..88].copy_from_slice(&both_endian_u32(total_sectors));
    pvd[120..124].copy_from_slice(&both_endian_u16(1)); // volume set size
    pvd[124..128].copy_from_slice(&both_endian_u16(1)); // volume sequence number
    pvd[128..132].copy_from_slice(&both_endian_u16(SECTOR as u16)); // logical block size

    let root_record = directory_record(".", ROOT_DIR_LBA, SECTOR as u32, true, Some(0));
    pvd[156..156 + root_record.len()].copy_from_slice(&root_record);

    let mut terminator = vec![0u8; SECTOR];
    terminator[0] = 255;
    terminator[1..6].copy_from_slice(b"CD001");
    terminator[6] = 1;

    let mut image = vec![0u8; (PVD_LBA as usize) * SECTOR];
    image.extend_from_slice(&pvd);
    image.extend_from_slice(&terminator);
    debug_assert_eq!(image.len(), (TERMINATOR_LBA as usize + 1) * SECTOR);
    image.extend_from_slice(&root_dir);

    for (file, _lba, _size) in &file_records {
        image.extend_from_slice(&file.data);
        pad_to_sector(&mut image);
    }

    Ok(image)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builds_a_multiple_of_the_sector_size() {
        let iso = build_iso("cidata", &[("user-data".into(), b"#cloud-config\n".to_vec())]).unwrap();
        assert_eq!(iso.len() % SECTOR, 0);
    }

    #[test]
    fn embeds_the_volume_id() {
        let iso = build_iso("cidata", &[("user-data".into(), vec![1, 2, 3])]).unwrap();
        let pvd = &iso[16 * SECTOR..17 * SECTOR];
        assert_eq!(&pvd[40..46], b"CIDATA");
    }

    #[test]
    fn is_byte_identical_across_calls() {
        let files = vec![("user-data".into(), b"a".to_vec()), ("meta-data".into(), b"b".to_vec())];
        let a = build_iso("cidata", &files).unwrap();
        let b = build_iso("cidata", &files).unwrap();
        assert_eq!(a, b);
    }
}
