use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::storage::{consts::PAGE_SIZE, DiskPageReader, DiskPageWriter};

use bitflags::bitflags;
use crc::crc32;

// header page (page 0)
const P_MAGIC: usize = 0;
const P_VERSION: usize = P_MAGIC + 4;
const P_COUNT: usize = P_VERSION + 4;
const P_MAX_PAGE: usize = P_COUNT + 8;
const P_FREE_HEAD: usize = P_MAX_PAGE + 4;
const P_FLAGS: usize = P_FREE_HEAD + 4;
const P_ROOT: usize = P_FLAGS + 4;
const P_LEFTMOST: usize = P_ROOT + 4;
const P_CRC: usize = P_LEFTMOST + 4;

pub const BTREE_MAGIC: u32 = 0x4254_5231;
pub const BTREE_VERSION: u32 = 1;

// index pages
const P_ENTRY_COUNT: usize = 0;
const P_LEVEL: usize = P_ENTRY_COUNT + 2;
const P_NEXT: usize = P_LEVEL + 2;
const P_FREE_TAIL: usize = P_NEXT + 4;
const P_PAYLOAD: usize = P_FREE_TAIL + 2;

const SLOT_SIZE: usize = 4;

/// Level value marking a page on the free list.
pub const FREE_PAGE_LEVEL: u16 = 0xFFFF;

/// Ceiling on a marshalled leaf entry. Conservative enough that both
/// halves of any split fit their pages, separators included.
pub const MAX_LEAF_ENTRY_SIZE: usize = 1024;

bitflags! {
    pub struct BtreeFileFlags: u32 {
        const IS_UNIQUE = 0b0000_0001;
    }
}

pub mod views {
    pub use super::{
        BtreeHeaderPageReader, BtreeHeaderPageView, BtreeHeaderPageViewMut, BtreeHeaderPageWriter,
        BtreeIndexPageReader, BtreeIndexPageView, BtreeIndexPageViewMut, BtreeIndexPageWriter,
    };
}

pub trait BtreeHeaderPageReader: DiskPageReader {
    fn get_magic(&self) -> u32 {
        (&self.get_page_buffer()[P_MAGIC..])
            .read_u32::<LittleEndian>()
            .unwrap()
    }

    fn get_version(&self) -> u32 {
        (&self.get_page_buffer()[P_VERSION..])
            .read_u32::<LittleEndian>()
            .unwrap()
    }

    fn get_count(&self) -> u64 {
        (&self.get_page_buffer()[P_COUNT..])
            .read_u64::<LittleEndian>()
            .unwrap()
    }

    fn get_max_page(&self) -> u32 {
        (&self.get_page_buffer()[P_MAX_PAGE..])
            .read_u32::<LittleEndian>()
            .unwrap()
    }

    fn get_free_head(&self) -> u32 {
        (&self.get_page_buffer()[P_FREE_HEAD..])
            .read_u32::<LittleEndian>()
            .unwrap()
    }

    fn get_flags(&self) -> BtreeFileFlags {
        BtreeFileFlags::from_bits_truncate(
            (&self.get_page_buffer()[P_FLAGS..])
                .read_u32::<LittleEndian>()
                .unwrap(),
        )
    }

    fn get_root(&self) -> u32 {
        (&self.get_page_buffer()[P_ROOT..])
            .read_u32::<LittleEndian>()
            .unwrap()
    }

    fn get_leftmost(&self) -> u32 {
        (&self.get_page_buffer()[P_LEFTMOST..])
            .read_u32::<LittleEndian>()
            .unwrap()
    }

    fn get_crc(&self) -> u32 {
        (&self.get_page_buffer()[P_CRC..])
            .read_u32::<LittleEndian>()
            .unwrap()
    }

    fn crc_ok(&self) -> bool {
        crc32::checksum_ieee(&self.get_page_buffer()[..P_CRC]) == self.get_crc()
    }
}

pub trait BtreeHeaderPageWriter: BtreeHeaderPageReader + DiskPageWriter {
    fn set_count(&mut self, count: u64) {
        (&mut self.get_page_buffer_mut()[P_COUNT..])
            .write_u64::<LittleEndian>(count)
            .unwrap();
    }

    fn set_max_page(&mut self, max_page: u32) {
        (&mut self.get_page_buffer_mut()[P_MAX_PAGE..])
            .write_u32::<LittleEndian>(max_page)
            .unwrap();
    }

    fn set_free_head(&mut self, head: u32) {
        (&mut self.get_page_buffer_mut()[P_FREE_HEAD..])
            .write_u32::<LittleEndian>(head)
            .unwrap();
    }

    fn set_flags(&mut self, flags: BtreeFileFlags) {
        (&mut self.get_page_buffer_mut()[P_FLAGS..])
            .write_u32::<LittleEndian>(flags.bits())
            .unwrap();
    }

    fn set_root(&mut self, root: u32) {
        (&mut self.get_page_buffer_mut()[P_ROOT..])
            .write_u32::<LittleEndian>(root)
            .unwrap();
    }

    fn set_leftmost(&mut self, leftmost: u32) {
        (&mut self.get_page_buffer_mut()[P_LEFTMOST..])
            .write_u32::<LittleEndian>(leftmost)
            .unwrap();
    }

    /// Reseal the header after a mutation.
    fn update_crc(&mut self) {
        let crc = crc32::checksum_ieee(&self.get_page_buffer()[..P_CRC]);
        (&mut self.get_page_buffer_mut()[P_CRC..])
            .write_u32::<LittleEndian>(crc)
            .unwrap();
    }

    fn init_page(&mut self, unique: bool) {
        for b in self.get_page_buffer_mut()[..P_CRC + 4].iter_mut() {
            *b = 0;
        }
        (&mut self.get_page_buffer_mut()[P_MAGIC..])
            .write_u32::<LittleEndian>(BTREE_MAGIC)
            .unwrap();
        (&mut self.get_page_buffer_mut()[P_VERSION..])
            .write_u32::<LittleEndian>(BTREE_VERSION)
            .unwrap();
        let flags = if unique {
            BtreeFileFlags::IS_UNIQUE
        } else {
            BtreeFileFlags::empty()
        };
        self.set_flags(flags);
        self.update_crc();
    }
}

pub trait BtreeIndexPageReader: DiskPageReader {
    fn get_entry_count(&self) -> usize {
        (&self.get_page_buffer()[P_ENTRY_COUNT..])
            .read_u16::<LittleEndian>()
            .unwrap() as usize
    }

    fn get_level(&self) -> u16 {
        (&self.get_page_buffer()[P_LEVEL..])
            .read_u16::<LittleEndian>()
            .unwrap()
    }

    fn is_leaf(&self) -> bool {
        self.get_level() == 0
    }

    fn is_free(&self) -> bool {
        self.get_level() == FREE_PAGE_LEVEL
    }

    fn get_next(&self) -> u32 {
        (&self.get_page_buffer()[P_NEXT..])
            .read_u32::<LittleEndian>()
            .unwrap()
    }

    fn get_free_tail(&self) -> usize {
        (&self.get_page_buffer()[P_FREE_TAIL..])
            .read_u16::<LittleEndian>()
            .unwrap() as usize
    }

    fn get_slot(&self, index: usize) -> (usize, usize) {
        let base = P_PAYLOAD + index * SLOT_SIZE;
        let off = (&self.get_page_buffer()[base..])
            .read_u16::<LittleEndian>()
            .unwrap() as usize;
        let len = (&self.get_page_buffer()[base + 2..])
            .read_u16::<LittleEndian>()
            .unwrap() as usize;
        (off, len)
    }

    fn get_entry(&self, index: usize) -> &[u8] {
        let (off, len) = self.get_slot(index);
        &self.get_page_buffer()[off..off + len]
    }

    fn get_free_space(&self) -> usize {
        self.get_free_tail() - (P_PAYLOAD + SLOT_SIZE * self.get_entry_count())
    }

    fn has_room(&self, entry_len: usize) -> bool {
        self.get_free_space() >= entry_len + SLOT_SIZE
    }
}

pub trait BtreeIndexPageWriter: BtreeIndexPageReader + DiskPageWriter {
    fn init_page(&mut self, level: u16) {
        for b in self.get_page_buffer_mut()[..P_PAYLOAD].iter_mut() {
            *b = 0;
        }
        self.set_level(level);
        (&mut self.get_page_buffer_mut()[P_FREE_TAIL..])
            .write_u16::<LittleEndian>(PAGE_SIZE as u16)
            .unwrap();
    }

    fn set_entry_count(&mut self, count: usize) {
        (&mut self.get_page_buffer_mut()[P_ENTRY_COUNT..])
            .write_u16::<LittleEndian>(count as u16)
            .unwrap();
    }

    fn set_level(&mut self, level: u16) {
        (&mut self.get_page_buffer_mut()[P_LEVEL..])
            .write_u16::<LittleEndian>(level)
            .unwrap();
    }

    fn set_next(&mut self, next: u32) {
        (&mut self.get_page_buffer_mut()[P_NEXT..])
            .write_u32::<LittleEndian>(next)
            .unwrap();
    }

    fn set_free_tail(&mut self, tail: usize) {
        (&mut self.get_page_buffer_mut()[P_FREE_TAIL..])
            .write_u16::<LittleEndian>(tail as u16)
            .unwrap();
    }

    fn set_slot(&mut self, index: usize, off: usize, len: usize) {
        let base = P_PAYLOAD + index * SLOT_SIZE;
        (&mut self.get_page_buffer_mut()[base..])
            .write_u16::<LittleEndian>(off as u16)
            .unwrap();
        (&mut self.get_page_buffer_mut()[base + 2..])
            .write_u16::<LittleEndian>(len as u16)
            .unwrap();
    }

    /// Insert an entry at the slot index, shifting later slots right.
    /// The caller checks `has_room` first.
    fn insert_entry(&mut self, index: usize, entry: &[u8]) {
        let count = self.get_entry_count();
        let free_tail = self.get_free_tail();
        let off = free_tail - entry.len();

        self.get_page_buffer_mut()[off..off + entry.len()].copy_from_slice(entry);

        let slot_start = P_PAYLOAD + index * SLOT_SIZE;
        let slot_end = P_PAYLOAD + count * SLOT_SIZE;
        self.get_page_buffer_mut()
            .copy_within(slot_start..slot_end, slot_start + SLOT_SIZE);

        self.set_slot(index, off, entry.len());
        self.set_entry_count(count + 1);
        self.set_free_tail(off);
    }

    /// Remove the entry at the slot index and compact the entry area.
    fn remove_entry(&mut self, index: usize) {
        let count = self.get_entry_count();
        let free_tail = self.get_free_tail();
        let (off, len) = self.get_slot(index);

        // close the hole left in the entry area
        self.get_page_buffer_mut()
            .copy_within(free_tail..off, free_tail + len);

        // drop the slot
        let slot_start = P_PAYLOAD + index * SLOT_SIZE;
        let slot_end = P_PAYLOAD + count * SLOT_SIZE;
        self.get_page_buffer_mut()
            .copy_within(slot_start + SLOT_SIZE..slot_end, slot_start);
        self.set_entry_count(count - 1);
        self.set_free_tail(free_tail + len);

        // entries that lived below the removed one moved up by `len`
        for i in 0..count - 1 {
            let (o, l) = self.get_slot(i);
            if o < off {
                self.set_slot(i, o + len, l);
            }
        }
    }
}

// =============== BtreeHeaderPageView ===============

pub struct BtreeHeaderPageView<'a> {
    buffer: &'a [u8; PAGE_SIZE],
}

impl<'a> BtreeHeaderPageView<'a> {
    pub fn new(buffer: &'a [u8; PAGE_SIZE]) -> Self {
        Self { buffer }
    }
}

impl<'a> DiskPageReader for BtreeHeaderPageView<'a> {
    fn get_page_buffer(&self) -> &[u8; PAGE_SIZE] {
        self.buffer
    }
}

impl<'a> BtreeHeaderPageReader for BtreeHeaderPageView<'a> {}

pub struct BtreeHeaderPageViewMut<'a> {
    buffer: &'a mut [u8; PAGE_SIZE],
}

impl<'a> BtreeHeaderPageViewMut<'a> {
    pub fn new(buffer: &'a mut [u8; PAGE_SIZE]) -> Self {
        Self { buffer }
    }
}

impl<'a> DiskPageReader for BtreeHeaderPageViewMut<'a> {
    fn get_page_buffer(&self) -> &[u8; PAGE_SIZE] {
        self.buffer
    }
}

impl<'a> DiskPageWriter for BtreeHeaderPageViewMut<'a> {
    fn get_page_buffer_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        self.buffer
    }
}

impl<'a> BtreeHeaderPageReader for BtreeHeaderPageViewMut<'a> {}
impl<'a> BtreeHeaderPageWriter for BtreeHeaderPageViewMut<'a> {}

// =============== BtreeIndexPageView ===============

pub struct BtreeIndexPageView<'a> {
    buffer: &'a [u8; PAGE_SIZE],
}

impl<'a> BtreeIndexPageView<'a> {
    pub fn new(buffer: &'a [u8; PAGE_SIZE]) -> Self {
        Self { buffer }
    }
}

impl<'a> DiskPageReader for BtreeIndexPageView<'a> {
    fn get_page_buffer(&self) -> &[u8; PAGE_SIZE] {
        self.buffer
    }
}

impl<'a> BtreeIndexPageReader for BtreeIndexPageView<'a> {}

pub struct BtreeIndexPageViewMut<'a> {
    buffer: &'a mut [u8; PAGE_SIZE],
}

impl<'a> BtreeIndexPageViewMut<'a> {
    pub fn new(buffer: &'a mut [u8; PAGE_SIZE]) -> Self {
        Self { buffer }
    }
}

impl<'a> DiskPageReader for BtreeIndexPageViewMut<'a> {
    fn get_page_buffer(&self) -> &[u8; PAGE_SIZE] {
        self.buffer
    }
}

impl<'a> DiskPageWriter for BtreeIndexPageViewMut<'a> {
    fn get_page_buffer_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        self.buffer
    }
}

impl<'a> BtreeIndexPageReader for BtreeIndexPageViewMut<'a> {}
impl<'a> BtreeIndexPageWriter for BtreeIndexPageViewMut<'a> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_page_round_trip() {
        let mut buffer = [0u8; PAGE_SIZE];
        let mut view = BtreeHeaderPageViewMut::new(&mut buffer);
        view.init_page(true);
        view.set_count(42);
        view.set_max_page(7);
        view.set_root(3);
        view.set_leftmost(2);
        view.set_free_head(5);
        view.update_crc();

        let view = BtreeHeaderPageView::new(&buffer);
        assert_eq!(view.get_magic(), BTREE_MAGIC);
        assert_eq!(view.get_version(), BTREE_VERSION);
        assert_eq!(view.get_count(), 42);
        assert_eq!(view.get_max_page(), 7);
        assert_eq!(view.get_root(), 3);
        assert_eq!(view.get_leftmost(), 2);
        assert_eq!(view.get_free_head(), 5);
        assert!(view.get_flags().contains(BtreeFileFlags::IS_UNIQUE));
        assert!(view.crc_ok());
    }

    #[test]
    fn crc_detects_corruption() {
        let mut buffer = [0u8; PAGE_SIZE];
        let mut view = BtreeHeaderPageViewMut::new(&mut buffer);
        view.init_page(false);
        view.set_count(1);
        // count changed without resealing
        let view = BtreeHeaderPageView::new(&buffer);
        assert!(!view.crc_ok());
    }

    #[test]
    fn insert_and_remove_entries() {
        let mut buffer = [0u8; PAGE_SIZE];
        let mut view = BtreeIndexPageViewMut::new(&mut buffer);
        view.init_page(0);

        view.insert_entry(0, b"bb");
        view.insert_entry(0, b"aaaa");
        view.insert_entry(2, b"cc");

        let view = BtreeIndexPageView::new(&buffer);
        assert_eq!(view.get_entry_count(), 3);
        assert_eq!(view.get_entry(0), b"aaaa");
        assert_eq!(view.get_entry(1), b"bb");
        assert_eq!(view.get_entry(2), b"cc");
        assert!(view.is_leaf());

        let mut view = BtreeIndexPageViewMut::new(&mut buffer);
        view.remove_entry(1);
        let view = BtreeIndexPageView::new(&buffer);
        assert_eq!(view.get_entry_count(), 2);
        assert_eq!(view.get_entry(0), b"aaaa");
        assert_eq!(view.get_entry(1), b"cc");

        // the freed bytes are reclaimed
        let free_before = view.get_free_space();
        let mut view = BtreeIndexPageViewMut::new(&mut buffer);
        view.insert_entry(1, b"bb");
        view.remove_entry(1);
        let view = BtreeIndexPageView::new(&buffer);
        assert_eq!(view.get_free_space(), free_before);
    }
}
