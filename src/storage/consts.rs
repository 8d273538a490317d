pub const PAGE_SIZE: usize = 4096;
