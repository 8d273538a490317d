use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::storage::{consts::PAGE_SIZE, DiskPageReader, DiskPageWriter};

use crc::crc32;

// header page (page 0)
const P_MAGIC: usize = 0;
const P_VERSION: usize = P_MAGIC + 4;
const P_COUNT: usize = P_VERSION + 4;
const P_MAX_PAGE: usize = P_COUNT + 8;
const P_CRC: usize = P_MAX_PAGE + 4;

pub const VECTOR_MAGIC: u32 = 0x5643_5231;
pub const VECTOR_VERSION: u32 = 1;

// data pages
const P_DATA_COUNT: usize = 0;
pub const DATA_PAGE_HEADER_SIZE: usize = P_DATA_COUNT + 4;

/// Data pages covered by one occupancy bitmap page.
pub const DATA_PAGES_PER_BLOCK: usize = PAGE_SIZE * 8;

/// Block stride: the bitmap page plus the data pages it covers.
pub const PAGES_PER_TABLE: usize = DATA_PAGES_PER_BLOCK + 1;

pub mod views {
    pub use super::{
        VectorBitmapPageView, VectorBitmapPageViewMut, VectorDataPageReader, VectorDataPageView,
        VectorDataPageViewMut, VectorDataPageWriter, VectorHeaderPageReader, VectorHeaderPageView,
        VectorHeaderPageViewMut, VectorHeaderPageWriter,
    };
}

pub trait VectorHeaderPageReader: DiskPageReader {
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

    fn get_crc(&self) -> u32 {
        (&self.get_page_buffer()[P_CRC..])
            .read_u32::<LittleEndian>()
            .unwrap()
    }

    fn crc_ok(&self) -> bool {
        crc32::checksum_ieee(&self.get_page_buffer()[..P_CRC]) == self.get_crc()
    }
}

pub trait VectorHeaderPageWriter: VectorHeaderPageReader + DiskPageWriter {
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

    fn update_crc(&mut self) {
        let crc = crc32::checksum_ieee(&self.get_page_buffer()[..P_CRC]);
        (&mut self.get_page_buffer_mut()[P_CRC..])
            .write_u32::<LittleEndian>(crc)
            .unwrap();
    }

    fn init_page(&mut self) {
        for b in self.get_page_buffer_mut()[..P_CRC + 4].iter_mut() {
            *b = 0;
        }
        (&mut self.get_page_buffer_mut()[P_MAGIC..])
            .write_u32::<LittleEndian>(VECTOR_MAGIC)
            .unwrap();
        (&mut self.get_page_buffer_mut()[P_VERSION..])
            .write_u32::<LittleEndian>(VECTOR_VERSION)
            .unwrap();
        self.update_crc();
    }
}

pub trait VectorDataPageReader: DiskPageReader {
    fn get_data_count(&self) -> u32 {
        (&self.get_page_buffer()[P_DATA_COUNT..])
            .read_u32::<LittleEndian>()
            .unwrap()
    }

    fn get_slot(&self, position: usize, slot_size: usize) -> &[u8] {
        let off = DATA_PAGE_HEADER_SIZE + position * slot_size;
        &self.get_page_buffer()[off..off + slot_size]
    }

    fn is_slot_free(&self, position: usize, slot_size: usize) -> bool {
        self.get_slot(position, slot_size).iter().all(|b| *b == 0xFF)
    }
}

pub trait VectorDataPageWriter: VectorDataPageReader + DiskPageWriter {
    fn set_data_count(&mut self, count: u32) {
        (&mut self.get_page_buffer_mut()[P_DATA_COUNT..])
            .write_u32::<LittleEndian>(count)
            .unwrap();
    }

    fn set_slot(&mut self, position: usize, slot_size: usize, bytes: &[u8]) {
        let off = DATA_PAGE_HEADER_SIZE + position * slot_size;
        self.get_page_buffer_mut()[off..off + slot_size].copy_from_slice(bytes);
    }

    fn reset_slot(&mut self, position: usize, slot_size: usize) {
        let off = DATA_PAGE_HEADER_SIZE + position * slot_size;
        for b in self.get_page_buffer_mut()[off..off + slot_size].iter_mut() {
            *b = 0xFF;
        }
    }

    /// Fresh data page: zero live slots, every slot erased.
    fn init_page(&mut self) {
        self.set_data_count(0);
        for b in self.get_page_buffer_mut()[DATA_PAGE_HEADER_SIZE..].iter_mut() {
            *b = 0xFF;
        }
    }
}

// =============== page views ===============

pub struct VectorHeaderPageView<'a> {
    buffer: &'a [u8; PAGE_SIZE],
}

impl<'a> VectorHeaderPageView<'a> {
    pub fn new(buffer: &'a [u8; PAGE_SIZE]) -> Self {
        Self { buffer }
    }
}

impl<'a> DiskPageReader for VectorHeaderPageView<'a> {
    fn get_page_buffer(&self) -> &[u8; PAGE_SIZE] {
        self.buffer
    }
}

impl<'a> VectorHeaderPageReader for VectorHeaderPageView<'a> {}

pub struct VectorHeaderPageViewMut<'a> {
    buffer: &'a mut [u8; PAGE_SIZE],
}

impl<'a> VectorHeaderPageViewMut<'a> {
    pub fn new(buffer: &'a mut [u8; PAGE_SIZE]) -> Self {
        Self { buffer }
    }
}

impl<'a> DiskPageReader for VectorHeaderPageViewMut<'a> {
    fn get_page_buffer(&self) -> &[u8; PAGE_SIZE] {
        self.buffer
    }
}

impl<'a> DiskPageWriter for VectorHeaderPageViewMut<'a> {
    fn get_page_buffer_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        self.buffer
    }
}

impl<'a> VectorHeaderPageReader for VectorHeaderPageViewMut<'a> {}
impl<'a> VectorHeaderPageWriter for VectorHeaderPageViewMut<'a> {}

/// The occupancy bitmap covering the data pages of one block: bit i is
/// on iff the i-th data page of the block holds at least one live slot.
pub struct VectorBitmapPageView<'a> {
    buffer: &'a [u8; PAGE_SIZE],
}

impl<'a> VectorBitmapPageView<'a> {
    pub fn new(buffer: &'a [u8; PAGE_SIZE]) -> Self {
        Self { buffer }
    }

    pub fn get_bit(&self, index: usize) -> bool {
        self.buffer[index / 8] & (1 << (index % 8)) != 0
    }

    /// First occupied data page at or after `from`, within the block.
    pub fn next_set(&self, from: usize) -> Option<usize> {
        (from..DATA_PAGES_PER_BLOCK).find(|i| self.get_bit(*i))
    }

    /// Last occupied data page at or before `from`, within the block.
    pub fn prev_set(&self, from: usize) -> Option<usize> {
        (0..=from.min(DATA_PAGES_PER_BLOCK - 1))
            .rev()
            .find(|i| self.get_bit(*i))
    }
}

pub struct VectorBitmapPageViewMut<'a> {
    buffer: &'a mut [u8; PAGE_SIZE],
}

impl<'a> VectorBitmapPageViewMut<'a> {
    pub fn new(buffer: &'a mut [u8; PAGE_SIZE]) -> Self {
        Self { buffer }
    }

    pub fn set_bit(&mut self, index: usize, on: bool) {
        if on {
            self.buffer[index / 8] |= 1 << (index % 8);
        } else {
            self.buffer[index / 8] &= !(1 << (index % 8));
        }
    }
}

pub struct VectorDataPageView<'a> {
    buffer: &'a [u8; PAGE_SIZE],
}

impl<'a> VectorDataPageView<'a> {
    pub fn new(buffer: &'a [u8; PAGE_SIZE]) -> Self {
        Self { buffer }
    }
}

impl<'a> DiskPageReader for VectorDataPageView<'a> {
    fn get_page_buffer(&self) -> &[u8; PAGE_SIZE] {
        self.buffer
    }
}

impl<'a> VectorDataPageReader for VectorDataPageView<'a> {}

pub struct VectorDataPageViewMut<'a> {
    buffer: &'a mut [u8; PAGE_SIZE],
}

impl<'a> VectorDataPageViewMut<'a> {
    pub fn new(buffer: &'a mut [u8; PAGE_SIZE]) -> Self {
        Self { buffer }
    }
}

impl<'a> DiskPageReader for VectorDataPageViewMut<'a> {
    fn get_page_buffer(&self) -> &[u8; PAGE_SIZE] {
        self.buffer
    }
}

impl<'a> DiskPageWriter for VectorDataPageViewMut<'a> {
    fn get_page_buffer_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        self.buffer
    }
}

impl<'a> VectorDataPageReader for VectorDataPageViewMut<'a> {}
impl<'a> VectorDataPageWriter for VectorDataPageViewMut<'a> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut buffer = [0u8; PAGE_SIZE];
        let mut view = VectorHeaderPageViewMut::new(&mut buffer);
        view.init_page();
        view.set_count(9);
        view.set_max_page(4);
        view.update_crc();

        let view = VectorHeaderPageView::new(&buffer);
        assert_eq!(view.get_magic(), VECTOR_MAGIC);
        assert_eq!(view.get_count(), 9);
        assert_eq!(view.get_max_page(), 4);
        assert!(view.crc_ok());
    }

    #[test]
    fn data_page_slots() {
        let mut buffer = [0u8; PAGE_SIZE];
        let mut view = VectorDataPageViewMut::new(&mut buffer);
        view.init_page();

        assert!(view.is_slot_free(0, 8));
        view.set_slot(0, 8, &[0, 1, 2, 3, 4, 5, 6, 7]);
        view.set_data_count(1);
        assert!(!view.is_slot_free(0, 8));
        assert!(view.is_slot_free(1, 8));

        view.reset_slot(0, 8);
        assert!(view.is_slot_free(0, 8));
    }

    #[test]
    fn bitmap_scanning() {
        let mut buffer = [0u8; PAGE_SIZE];
        let mut view = VectorBitmapPageViewMut::new(&mut buffer);
        view.set_bit(3, true);
        view.set_bit(100, true);

        let view = VectorBitmapPageView::new(&buffer);
        assert!(view.get_bit(3));
        assert_eq!(view.next_set(0), Some(3));
        assert_eq!(view.next_set(4), Some(100));
        assert_eq!(view.next_set(101), None);
        assert_eq!(view.prev_set(99), Some(3));
        assert_eq!(view.prev_set(2), None);
    }
}
