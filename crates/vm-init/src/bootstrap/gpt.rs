//! Minimal GUID Partition Table editing: enough to grow a partition
//! into space added to the disk after the image was built.
//!
//! Header layout (little endian, LBA 1):
//!
//! | offset | size | field                   |
//! |--------|------|-------------------------|
//! | 0      | 8    | signature `EFI PART`    |
//! | 12     | 4    | header size             |
//! | 16     | 4    | header CRC32            |
//! | 24     | 8    | this header's LBA       |
//! | 32     | 8    | alternate header's LBA  |
//! | 40     | 8    | first usable LBA        |
//! | 48     | 8    | last usable LBA         |
//! | 72     | 8    | partition entries LBA   |
//! | 80     | 4    | number of entries       |
//! | 84     | 4    | size of one entry       |
//! | 88     | 4    | partition entries CRC32 |

const SIGNATURE: &[u8; 8] = b"EFI PART";

const HEADER_SIZE: usize = 12;
const HEADER_CRC: usize = 16;
const MY_LBA: usize = 24;
const ALTERNATE_LBA: usize = 32;
const LAST_USABLE: usize = 48;
const ENTRIES_LBA: usize = 72;
const NUM_ENTRIES: usize = 80;
const ENTRY_SIZE: usize = 84;
const ENTRIES_CRC: usize = 88;

const ENTRY_TYPE: std::ops::Range<usize> = 0..16;
const ENTRY_FIRST_LBA: usize = 32;
const ENTRY_LAST_LBA: usize = 40;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GptError {
    #[error("gpt: missing EFI PART signature")]
    Signature,
    #[error("gpt: header checksum mismatch")]
    HeaderCrc,
    #[error("gpt: truncated {0}")]
    Truncated(&'static str),
    #[error("gpt: partition {0} not found")]
    NoPartition(u32),
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(buf.get(at..at + 4)?.try_into().ok()?))
}

fn read_u64(buf: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_le_bytes(buf.get(at..at + 8)?.try_into().ok()?))
}

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    if let Some(slot) = buf.get_mut(at..at + 4) {
        slot.copy_from_slice(&value.to_le_bytes());
    }
}

fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    if let Some(slot) = buf.get_mut(at..at + 8) {
        slot.copy_from_slice(&value.to_le_bytes());
    }
}

/// Where the partition entry array lives, read from the primary header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryArray {
    pub lba: u64,
    pub len: usize,
}

/// The primary header plus its partition entry array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gpt {
    header: Vec<u8>,
    entries: Vec<u8>,
    block_size: u64,
}

/// The result of growing a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Growth {
    pub first_lba: u64,
    pub old_last_lba: u64,
    pub new_last_lba: u64,
}

impl Gpt {
    /// Validate the primary header block and locate the entry array.
    pub fn entry_array(header_block: &[u8]) -> Result<EntryArray, GptError> {
        let header = checked_header(header_block)?;
        let count = read_u32(header, NUM_ENTRIES).ok_or(GptError::Truncated("header"))?;
        let size = read_u32(header, ENTRY_SIZE).ok_or(GptError::Truncated("header"))?;
        Ok(EntryArray {
            lba: read_u64(header, ENTRIES_LBA).ok_or(GptError::Truncated("header"))?,
            len: count as usize * size as usize,
        })
    }

    pub fn parse(header_block: &[u8], entries: &[u8], block_size: u64) -> Result<Self, GptError> {
        let array = Self::entry_array(header_block)?;
        let header = checked_header(header_block)?.to_vec();
        let entries = entries
            .get(..array.len)
            .ok_or(GptError::Truncated("entries"))?
            .to_vec();
        Ok(Self {
            header,
            entries,
            block_size,
        })
    }

    fn header_u32(&self, at: usize) -> u32 {
        read_u32(&self.header, at).unwrap_or_default()
    }

    fn header_u64(&self, at: usize) -> u64 {
        read_u64(&self.header, at).unwrap_or_default()
    }

    fn entry(&self, index: usize) -> Option<&[u8]> {
        let size = self.header_u32(ENTRY_SIZE) as usize;
        self.entries.get(index * size..(index + 1) * size)
    }

    fn entry_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        let size = self.header_u32(ENTRY_SIZE) as usize;
        self.entries.get_mut(index * size..(index + 1) * size)
    }

    fn entry_sectors(&self) -> u64 {
        (self.entries.len() as u64).div_ceil(self.block_size)
    }

    pub fn last_usable_lba(&self) -> u64 {
        self.header_u64(LAST_USABLE)
    }

    /// 1-based partition number to `(first, last)` LBA.
    pub fn partition(&self, number: u32) -> Option<(u64, u64)> {
        let entry = self.entry(number.checked_sub(1)? as usize)?;
        if entry.get(ENTRY_TYPE)?.iter().all(|&b| b == 0) {
            return None;
        }
        Some((read_u64(entry, ENTRY_FIRST_LBA)?, read_u64(entry, ENTRY_LAST_LBA)?))
    }

    /// First LBA of the nearest partition starting after `lba`.
    fn next_start_after(&self, lba: u64) -> Option<u64> {
        (1..=self.header_u32(NUM_ENTRIES))
            .filter_map(|n| self.partition(n))
            .map(|(first, _)| first)
            .filter(|&first| first > lba)
            .min()
    }

    /// Extend partition `number` into free space up to the end of a disk of
    /// `total_sectors`, stopping short of any partition that follows it.
    ///
    /// Returns `Ok(None)` when there is no room to grow into.
    pub fn grow(&mut self, number: u32, total_sectors: u64) -> Result<Option<Growth>, GptError> {
        let (first_lba, old_last_lba) = self
            .partition(number)
            .ok_or(GptError::NoPartition(number))?;
        // Backup header in the last sector, backup entries right before it.
        let last_usable = total_sectors.saturating_sub(1 + self.entry_sectors() + 1);
        let new_last_lba = match self.next_start_after(first_lba) {
            Some(next) => last_usable.min(next - 1),
            None => last_usable,
        };
        if new_last_lba <= old_last_lba {
            return Ok(None);
        }

        if let Some(entry) = self.entry_mut(number as usize - 1) {
            put_u64(entry, ENTRY_LAST_LBA, new_last_lba);
        }
        put_u64(&mut self.header, LAST_USABLE, last_usable);
        put_u64(&mut self.header, ALTERNATE_LBA, total_sectors - 1);
        self.reseal();
        Ok(Some(Growth {
            first_lba,
            old_last_lba,
            new_last_lba,
        }))
    }

    fn reseal(&mut self) {
        put_u32(&mut self.header, ENTRIES_CRC, crc32fast::hash(&self.entries));
        seal(&mut self.header);
    }

    pub fn primary_header(&self) -> &[u8] {
        &self.header
    }

    pub fn entries(&self) -> &[u8] {
        &self.entries
    }

    pub fn primary_entries_lba(&self) -> u64 {
        self.header_u64(ENTRIES_LBA)
    }

    pub fn backup_header_lba(&self) -> u64 {
        self.header_u64(ALTERNATE_LBA)
    }

    /// The backup copy of the entries sits directly before the backup header.
    pub fn backup_entries_lba(&self) -> u64 {
        self.backup_header_lba().saturating_sub(self.entry_sectors())
    }

    /// The backup header: the primary with its own and alternate LBAs
    /// swapped and the entry array pointed at the backup copy.
    pub fn backup_header(&self) -> Vec<u8> {
        let mut backup = self.header.clone();
        put_u64(&mut backup, MY_LBA, self.backup_header_lba());
        put_u64(&mut backup, ALTERNATE_LBA, self.header_u64(MY_LBA));
        put_u64(&mut backup, ENTRIES_LBA, self.backup_entries_lba());
        seal(&mut backup);
        backup
    }
}

/// The header bytes, after signature and checksum validation.
fn checked_header(block: &[u8]) -> Result<&[u8], GptError> {
    if block.get(..8) != Some(SIGNATURE.as_slice()) {
        return Err(GptError::Signature);
    }
    let size = read_u32(block, HEADER_SIZE).ok_or(GptError::Truncated("header"))? as usize;
    let header = block.get(..size).ok_or(GptError::Truncated("header"))?;
    let stored = read_u32(header, HEADER_CRC).ok_or(GptError::Truncated("header"))?;
    let mut zeroed = header.to_vec();
    put_u32(&mut zeroed, HEADER_CRC, 0);
    if crc32fast::hash(&zeroed) != stored {
        return Err(GptError::HeaderCrc);
    }
    Ok(header)
}

fn seal(header: &mut [u8]) {
    put_u32(header, HEADER_CRC, 0);
    let crc = crc32fast::hash(header);
    put_u32(header, HEADER_CRC, crc);
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: u64 = 512;
    const ENTRIES: u32 = 128;
    const ENTRY_LEN: u32 = 128;

    /// A freshly built image: one partition filling a disk of `total` sectors.
    fn image(total: u64) -> (Vec<u8>, Vec<u8>) {
        let last_usable = total - 34;
        let mut entries = vec![0u8; (ENTRIES * ENTRY_LEN) as usize];
        entries[0..16].copy_from_slice(&[0xAF; 16]);
        put_u64(&mut entries, ENTRY_FIRST_LBA, 2048);
        put_u64(&mut entries, ENTRY_LAST_LBA, last_usable);

        let mut header = vec![0u8; BLOCK as usize];
        header[..8].copy_from_slice(SIGNATURE);
        put_u32(&mut header, 8, 0x0001_0000);
        put_u32(&mut header, HEADER_SIZE, 92);
        put_u64(&mut header, MY_LBA, 1);
        put_u64(&mut header, ALTERNATE_LBA, total - 1);
        put_u64(&mut header, 40, 34);
        put_u64(&mut header, LAST_USABLE, last_usable);
        put_u64(&mut header, ENTRIES_LBA, 2);
        put_u32(&mut header, NUM_ENTRIES, ENTRIES);
        put_u32(&mut header, ENTRY_SIZE, ENTRY_LEN);
        put_u32(&mut header, ENTRIES_CRC, crc32fast::hash(&entries));
        seal(&mut header[..92]);
        (header, entries)
    }

    #[test]
    fn entry_array_location() {
        let (header, _) = image(8192);
        assert_eq!(
            Gpt::entry_array(&header).unwrap(),
            EntryArray { lba: 2, len: 16384 }
        );
    }

    #[test]
    fn grows_last_partition_to_new_disk_end() {
        let (header, entries) = image(8192);
        let mut gpt = Gpt::parse(&header, &entries, BLOCK).unwrap();
        assert_eq!(gpt.partition(1), Some((2048, 8158)));

        let growth = gpt.grow(1, 16384).unwrap().unwrap();
        assert_eq!(
            growth,
            Growth {
                first_lba: 2048,
                old_last_lba: 8158,
                new_last_lba: 16350
            }
        );
        assert_eq!(gpt.partition(1), Some((2048, 16350)));
        assert_eq!(gpt.last_usable_lba(), 16350);
        assert_eq!(gpt.backup_header_lba(), 16383);
        assert_eq!(gpt.backup_entries_lba(), 16351);

        // Both headers re-validate with fresh checksums.
        let reparsed = Gpt::parse(gpt.primary_header(), gpt.entries(), BLOCK).unwrap();
        assert_eq!(reparsed, gpt);
        let backup = gpt.backup_header();
        assert_eq!(
            Gpt::entry_array(&backup).unwrap(),
            EntryArray {
                lba: 16351,
                len: 16384
            }
        );
        assert_eq!(read_u64(&backup, MY_LBA), Some(16383));
        assert_eq!(read_u64(&backup, ALTERNATE_LBA), Some(1));
    }

    /// `image(total)` with its partitions replaced by `parts` (first, last).
    fn partitioned(total: u64, parts: &[(u64, u64)]) -> (Vec<u8>, Vec<u8>) {
        let (mut header, mut entries) = image(total);
        entries.fill(0);
        for (i, &(first, last)) in parts.iter().enumerate() {
            let entry = &mut entries[i * ENTRY_LEN as usize..(i + 1) * ENTRY_LEN as usize];
            entry[0..16].copy_from_slice(&[0xAF; 16]);
            put_u64(entry, ENTRY_FIRST_LBA, first);
            put_u64(entry, ENTRY_LAST_LBA, last);
        }
        put_u32(&mut header, ENTRIES_CRC, crc32fast::hash(&entries));
        seal(&mut header[..92]);
        (header, entries)
    }

    #[test]
    fn partition_followed_by_another_is_not_grown_over_it() {
        let (header, entries) = partitioned(8192, &[(2048, 4095), (4096, 8158)]);
        let mut gpt = Gpt::parse(&header, &entries, BLOCK).unwrap();
        assert_eq!(gpt.grow(1, 16384).unwrap(), None);
        assert_eq!(gpt.partition(1), Some((2048, 4095)));
        assert_eq!(gpt.partition(2), Some((4096, 8158)));
    }

    #[test]
    fn growth_stops_at_the_next_partition() {
        let (header, entries) = partitioned(16384, &[(2048, 4095), (8192, 16350)]);
        let mut gpt = Gpt::parse(&header, &entries, BLOCK).unwrap();
        let growth = gpt.grow(1, 16384).unwrap().unwrap();
        assert_eq!(growth.new_last_lba, 8191);
        assert_eq!(gpt.partition(1), Some((2048, 8191)));
        assert_eq!(gpt.partition(2), Some((8192, 16350)));
    }

    #[test]
    fn trailing_partition_still_grows_to_disk_end() {
        let (header, entries) = partitioned(8192, &[(2048, 4095), (4096, 8158)]);
        let mut gpt = Gpt::parse(&header, &entries, BLOCK).unwrap();
        let growth = gpt.grow(2, 16384).unwrap().unwrap();
        assert_eq!(growth.new_last_lba, 16350);
        assert_eq!(gpt.partition(1), Some((2048, 4095)));
    }

    #[test]
    fn full_disk_is_left_alone() {
        let (header, entries) = image(8192);
        let mut gpt = Gpt::parse(&header, &entries, BLOCK).unwrap();
        assert_eq!(gpt.grow(1, 8192).unwrap(), None);
        assert_eq!(gpt.primary_header(), &header[..92]);
    }

    #[test]
    fn corrupt_header_is_rejected() {
        let (mut header, entries) = image(8192);
        header[LAST_USABLE] ^= 0xFF;
        assert_eq!(
            Gpt::parse(&header, &entries, BLOCK).unwrap_err(),
            GptError::HeaderCrc
        );
        assert_eq!(
            Gpt::parse(&[0u8; 512], &entries, BLOCK).unwrap_err(),
            GptError::Signature
        );
    }

    #[test]
    fn unknown_partition_is_an_error() {
        let (header, entries) = image(8192);
        let mut gpt = Gpt::parse(&header, &entries, BLOCK).unwrap();
        assert_eq!(gpt.grow(2, 16384).unwrap_err(), GptError::NoPartition(2));
        assert_eq!(gpt.grow(0, 16384).unwrap_err(), GptError::NoPartition(0));
    }
}
