// Journal On-Disk Format
// Superblock, block headers, descriptor tags and revoke records; all fields big-endian

use crate::transaction::Tid;
use byteorder::{BigEndian, ByteOrder};
use jbd_core::JournalError;
use static_assertions::const_assert;
use static_assertions::const_assert_eq;

/// Journal magic number
pub const JBD_MAGIC_NUMBER: u32 = 0xC03B3998;

/// Journal block header size
pub const HEADER_SIZE: usize = 12;
/// Logical size of the superblock
pub const SUPERBLOCK_SIZE: usize = 1024;
/// Descriptor tag: block number + flags
pub const TAG_SIZE: usize = 8;
pub const UUID_SIZE: usize = 16;
/// Revoke block header: journal header + byte count
pub const REVOKE_HEADER_SIZE: usize = HEADER_SIZE + 4;
/// Smallest block size a journal may use
pub const MIN_BLOCK_SIZE: usize = 1024;

/// Descriptor tag flags
pub const JBD_FLAG_ESCAPE: u32 = 1;
pub const JBD_FLAG_SAME_UUID: u32 = 2;
pub const JBD_FLAG_DELETED: u32 = 4;
pub const JBD_FLAG_LAST_TAG: u32 = 8;

/// Incompatible feature: the log may contain revoke blocks
pub const FEATURE_INCOMPAT_REVOKE: u32 = 0x1;
pub const KNOWN_INCOMPAT_FEATURES: u32 = FEATURE_INCOMPAT_REVOKE;
pub const KNOWN_ROCOMPAT_FEATURES: u32 = 0;

// Superblock field offsets
const SB_BLOCKSIZE: usize = 0x0C;
const SB_MAXLEN: usize = 0x10;
const SB_FIRST: usize = 0x14;
const SB_SEQUENCE: usize = 0x18;
const SB_START: usize = 0x1C;
const SB_ERRNO: usize = 0x20;
const SB_FEATURE_COMPAT: usize = 0x24;
const SB_FEATURE_INCOMPAT: usize = 0x28;
const SB_FEATURE_RO_COMPAT: usize = 0x2C;
const SB_UUID: usize = 0x30;
const SB_NR_USERS: usize = 0x40;
const SB_DYNSUPER: usize = 0x44;
const SB_MAX_TRANSACTION: usize = 0x48;
const SB_MAX_TRANS_DATA: usize = 0x4C;
const SB_USERS: usize = 0x100;
/// 16-byte ids of the filesystems sharing this journal
pub const SB_USERS_SIZE: usize = 16 * 48;

const_assert_eq!(SB_USERS + SB_USERS_SIZE, SUPERBLOCK_SIZE);
const_assert!(SB_MAX_TRANS_DATA + 4 <= SB_USERS);
const_assert!(SUPERBLOCK_SIZE <= MIN_BLOCK_SIZE);
const_assert!(HEADER_SIZE + TAG_SIZE + UUID_SIZE <= MIN_BLOCK_SIZE);

/// Journal block types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Descriptor = 1,
    Commit = 2,
    SuperblockV1 = 3,
    SuperblockV2 = 4,
    Revoke = 5,
}

impl BlockType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(BlockType::Descriptor),
            2 => Some(BlockType::Commit),
            3 => Some(BlockType::SuperblockV1),
            4 => Some(BlockType::SuperblockV2),
            5 => Some(BlockType::Revoke),
            _ => None,
        }
    }
}

/// Header at the start of every journal control block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    pub magic: u32,
    pub blocktype: u32,
    pub sequence: u32,
}

impl JournalHeader {
    pub fn new(blocktype: BlockType, sequence: Tid) -> Self {
        Self {
            magic: JBD_MAGIC_NUMBER,
            blocktype: blocktype as u32,
            sequence,
        }
    }

    /// Decode a header; callers check `magic` themselves
    pub fn parse(buf: &[u8]) -> Self {
        Self {
            magic: BigEndian::read_u32(&buf[0..4]),
            blocktype: BigEndian::read_u32(&buf[4..8]),
            sequence: BigEndian::read_u32(&buf[8..12]),
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        BigEndian::write_u32(&mut buf[0..4], self.magic);
        BigEndian::write_u32(&mut buf[4..8], self.blocktype);
        BigEndian::write_u32(&mut buf[8..12], self.sequence);
    }

    pub fn has_magic(&self) -> bool {
        self.magic == JBD_MAGIC_NUMBER
    }

    pub fn block_type(&self) -> Option<BlockType> {
        BlockType::from_u32(self.blocktype)
    }
}

/// Journal superblock (log block 0)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalSuperblock {
    pub header: JournalHeader,

    // Static information
    pub blocksize: u32,
    pub maxlen: u32,
    pub first: u32,

    // Dynamic information
    /// First transaction id expected in the log
    pub sequence: u32,
    /// Log block of the oldest live transaction, 0 when the log is empty
    pub start: u32,
    pub errno: i32,

    // Features (v2 only)
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,

    pub uuid: [u8; 16],
    pub nr_users: u32,
    pub dynsuper: u32,
    pub max_transaction: u32,
    pub max_trans_data: u32,
    pub users: [u8; SB_USERS_SIZE],
}

impl JournalSuperblock {
    /// Fresh v2 superblock for an empty log of `maxlen` blocks
    pub fn new(blocksize: u32, maxlen: u32, uuid: [u8; 16]) -> Self {
        let mut users = [0u8; SB_USERS_SIZE];
        users[..16].copy_from_slice(&uuid);
        Self {
            header: JournalHeader::new(BlockType::SuperblockV2, 0),
            blocksize,
            maxlen,
            first: 1,
            sequence: 1,
            start: 0,
            errno: 0,
            feature_compat: 0,
            feature_incompat: FEATURE_INCOMPAT_REVOKE,
            feature_ro_compat: 0,
            uuid,
            nr_users: 1,
            dynsuper: 0,
            max_transaction: 0,
            max_trans_data: 0,
            users,
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self, JournalError> {
        if buf.len() < SUPERBLOCK_SIZE {
            return Err(JournalError::Corrupted(format!(
                "superblock buffer too small: {} bytes",
                buf.len()
            )));
        }

        let header = JournalHeader::parse(buf);
        if !header.has_magic() {
            return Err(JournalError::Corrupted(format!(
                "bad journal magic {:#010x}",
                header.magic
            )));
        }
        match header.block_type() {
            Some(BlockType::SuperblockV1) | Some(BlockType::SuperblockV2) => {}
            _ => {
                return Err(JournalError::Corrupted(format!(
                    "block type {} is not a journal superblock",
                    header.blocktype
                )))
            }
        }

        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&buf[SB_UUID..SB_UUID + 16]);
        let mut users = [0u8; SB_USERS_SIZE];
        users.copy_from_slice(&buf[SB_USERS..SB_USERS + SB_USERS_SIZE]);

        Ok(Self {
            header,
            blocksize: BigEndian::read_u32(&buf[SB_BLOCKSIZE..]),
            maxlen: BigEndian::read_u32(&buf[SB_MAXLEN..]),
            first: BigEndian::read_u32(&buf[SB_FIRST..]),
            sequence: BigEndian::read_u32(&buf[SB_SEQUENCE..]),
            start: BigEndian::read_u32(&buf[SB_START..]),
            errno: BigEndian::read_i32(&buf[SB_ERRNO..]),
            feature_compat: BigEndian::read_u32(&buf[SB_FEATURE_COMPAT..]),
            feature_incompat: BigEndian::read_u32(&buf[SB_FEATURE_INCOMPAT..]),
            feature_ro_compat: BigEndian::read_u32(&buf[SB_FEATURE_RO_COMPAT..]),
            uuid,
            nr_users: BigEndian::read_u32(&buf[SB_NR_USERS..]),
            dynsuper: BigEndian::read_u32(&buf[SB_DYNSUPER..]),
            max_transaction: BigEndian::read_u32(&buf[SB_MAX_TRANSACTION..]),
            max_trans_data: BigEndian::read_u32(&buf[SB_MAX_TRANS_DATA..]),
            users,
        })
    }

    /// Encode into the first `SUPERBLOCK_SIZE` bytes of `buf`
    pub fn write(&self, buf: &mut [u8]) {
        buf[..SUPERBLOCK_SIZE].fill(0);
        self.header.write(buf);
        BigEndian::write_u32(&mut buf[SB_BLOCKSIZE..], self.blocksize);
        BigEndian::write_u32(&mut buf[SB_MAXLEN..], self.maxlen);
        BigEndian::write_u32(&mut buf[SB_FIRST..], self.first);
        BigEndian::write_u32(&mut buf[SB_SEQUENCE..], self.sequence);
        BigEndian::write_u32(&mut buf[SB_START..], self.start);
        BigEndian::write_i32(&mut buf[SB_ERRNO..], self.errno);
        BigEndian::write_u32(&mut buf[SB_FEATURE_COMPAT..], self.feature_compat);
        BigEndian::write_u32(&mut buf[SB_FEATURE_INCOMPAT..], self.feature_incompat);
        BigEndian::write_u32(&mut buf[SB_FEATURE_RO_COMPAT..], self.feature_ro_compat);
        buf[SB_UUID..SB_UUID + 16].copy_from_slice(&self.uuid);
        BigEndian::write_u32(&mut buf[SB_NR_USERS..], self.nr_users);
        BigEndian::write_u32(&mut buf[SB_DYNSUPER..], self.dynsuper);
        BigEndian::write_u32(&mut buf[SB_MAX_TRANSACTION..], self.max_transaction);
        BigEndian::write_u32(&mut buf[SB_MAX_TRANS_DATA..], self.max_trans_data);
        buf[SB_USERS..SB_USERS + SB_USERS_SIZE].copy_from_slice(&self.users);
    }

    pub fn is_v2(&self) -> bool {
        self.header.block_type() == Some(BlockType::SuperblockV2)
    }

    /// Check the superblock against the device it was read from
    pub fn validate(&self, block_size: usize, device_blocks: u64) -> Result<(), JournalError> {
        if self.blocksize as usize != block_size {
            return Err(JournalError::Corrupted(format!(
                "journal block size {} does not match device block size {}",
                self.blocksize, block_size
            )));
        }
        if self.maxlen as u64 > device_blocks {
            return Err(JournalError::Corrupted(format!(
                "journal length {} exceeds device of {} blocks",
                self.maxlen, device_blocks
            )));
        }
        if self.first == 0 || self.first >= self.maxlen {
            return Err(JournalError::Corrupted(format!(
                "invalid first log block {} (length {})",
                self.first, self.maxlen
            )));
        }
        if self.start != 0 && (self.start < self.first || self.start >= self.maxlen) {
            return Err(JournalError::Corrupted(format!(
                "log start {} outside [{}, {})",
                self.start, self.first, self.maxlen
            )));
        }
        if self.is_v2() {
            let unknown_incompat = self.feature_incompat & !KNOWN_INCOMPAT_FEATURES;
            if unknown_incompat != 0 {
                return Err(JournalError::Unsupported(format!(
                    "incompatible features {:#x}",
                    unknown_incompat
                )));
            }
            let unknown_ro = self.feature_ro_compat & !KNOWN_ROCOMPAT_FEATURES;
            if unknown_ro != 0 {
                return Err(JournalError::Unsupported(format!(
                    "read-only compatible features {:#x}",
                    unknown_ro
                )));
            }
        }
        Ok(())
    }
}

/// Descriptor block tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTag {
    pub blocknr: u32,
    pub flags: u32,
}

impl BlockTag {
    pub fn is_escaped(&self) -> bool {
        self.flags & JBD_FLAG_ESCAPE != 0
    }

    pub fn is_last(&self) -> bool {
        self.flags & JBD_FLAG_LAST_TAG != 0
    }

    pub fn same_uuid(&self) -> bool {
        self.flags & JBD_FLAG_SAME_UUID != 0
    }
}

/// Whether a descriptor with `space_left` free bytes can take another tag
fn tag_fits(space_left: usize) -> bool {
    space_left >= TAG_SIZE + UUID_SIZE
}

/// Number of tags that fit in one descriptor block
pub fn descriptor_capacity(block_size: usize) -> usize {
    let mut space_left = block_size - HEADER_SIZE;
    let mut tags = 0;
    while tag_fits(space_left) {
        space_left -= if tags == 0 { TAG_SIZE + UUID_SIZE } else { TAG_SIZE };
        tags += 1;
    }
    tags
}

/// Builds one descriptor block
///
/// The first tag carries the journal UUID; later tags are flagged
/// `SAME_UUID`. `finish` marks the final tag `LAST_TAG`.
pub struct DescriptorBuilder {
    buf: Vec<u8>,
    offset: usize,
    last_tag: Option<usize>,
    tags: usize,
    uuid: [u8; 16],
}

impl DescriptorBuilder {
    pub fn new(block_size: usize, sequence: Tid, uuid: [u8; 16]) -> Self {
        let mut buf = vec![0u8; block_size];
        JournalHeader::new(BlockType::Descriptor, sequence).write(&mut buf);
        Self {
            buf,
            offset: HEADER_SIZE,
            last_tag: None,
            tags: 0,
            uuid,
        }
    }

    pub fn space_left(&self) -> usize {
        self.buf.len() - self.offset
    }

    pub fn has_room(&self) -> bool {
        tag_fits(self.space_left())
    }

    pub fn tag_count(&self) -> usize {
        self.tags
    }

    pub fn is_empty(&self) -> bool {
        self.tags == 0
    }

    pub fn add_tag(&mut self, blocknr: u32, escaped: bool) {
        debug_assert!(self.has_room());
        let mut flags = 0;
        if escaped {
            flags |= JBD_FLAG_ESCAPE;
        }
        if self.tags > 0 {
            flags |= JBD_FLAG_SAME_UUID;
        }

        let at = self.offset;
        BigEndian::write_u32(&mut self.buf[at..at + 4], blocknr);
        BigEndian::write_u32(&mut self.buf[at + 4..at + 8], flags);
        self.offset += TAG_SIZE;
        if self.tags == 0 {
            self.buf[self.offset..self.offset + UUID_SIZE].copy_from_slice(&self.uuid);
            self.offset += UUID_SIZE;
        }
        self.last_tag = Some(at);
        self.tags += 1;
    }

    pub fn finish(mut self) -> Vec<u8> {
        if let Some(at) = self.last_tag {
            let flags = BigEndian::read_u32(&self.buf[at + 4..at + 8]) | JBD_FLAG_LAST_TAG;
            BigEndian::write_u32(&mut self.buf[at + 4..at + 8], flags);
        }
        self.buf
    }
}

/// Decode the tags of a descriptor block
pub fn parse_descriptor(buf: &[u8]) -> Vec<BlockTag> {
    let mut tags = Vec::new();
    let mut offset = HEADER_SIZE;
    while offset + TAG_SIZE <= buf.len() {
        let tag = BlockTag {
            blocknr: BigEndian::read_u32(&buf[offset..offset + 4]),
            flags: BigEndian::read_u32(&buf[offset + 4..offset + 8]),
        };
        offset += TAG_SIZE;
        if !tag.same_uuid() {
            offset += UUID_SIZE;
        }
        tags.push(tag);
        if tag.is_last() {
            break;
        }
    }
    tags
}

/// Block numbers one revoke block can carry
pub fn revoke_capacity(block_size: usize) -> usize {
    (block_size - REVOKE_HEADER_SIZE) / 4
}

/// Encode a revoke block; `blocks` must not exceed `revoke_capacity`
pub fn build_revoke_block(block_size: usize, sequence: Tid, blocks: &[u64]) -> Vec<u8> {
    debug_assert!(blocks.len() <= revoke_capacity(block_size));
    let mut buf = vec![0u8; block_size];
    JournalHeader::new(BlockType::Revoke, sequence).write(&mut buf);
    let mut offset = REVOKE_HEADER_SIZE;
    for &block in blocks {
        BigEndian::write_u32(&mut buf[offset..offset + 4], block as u32);
        offset += 4;
    }
    BigEndian::write_u32(&mut buf[HEADER_SIZE..REVOKE_HEADER_SIZE], offset as u32);
    buf
}

/// Decode the block numbers of a revoke block
pub fn parse_revoke_block(buf: &[u8]) -> Result<Vec<u64>, JournalError> {
    let count = BigEndian::read_u32(&buf[HEADER_SIZE..REVOKE_HEADER_SIZE]) as usize;
    if count < REVOKE_HEADER_SIZE || count > buf.len() || (count - REVOKE_HEADER_SIZE) % 4 != 0 {
        return Err(JournalError::corrupted(format!(
            "revoke block byte count {} invalid for {}-byte block",
            count,
            buf.len()
        )));
    }
    Ok(buf[REVOKE_HEADER_SIZE..count]
        .chunks_exact(4)
        .map(|chunk| BigEndian::read_u32(chunk) as u64)
        .collect())
}

/// Encode a commit block
pub fn build_commit_block(block_size: usize, sequence: Tid) -> Vec<u8> {
    let mut buf = vec![0u8; block_size];
    JournalHeader::new(BlockType::Commit, sequence).write(&mut buf);
    buf
}

/// Whether a block must be escaped before it is written to the log
pub fn needs_escape(data: &[u8]) -> bool {
    data.len() >= 4 && BigEndian::read_u32(&data[0..4]) == JBD_MAGIC_NUMBER
}

/// Zero the leading magic of a block image bound for the log
pub fn escape(data: &mut [u8]) {
    data[0..4].fill(0);
}

/// Restore the magic zeroed by `escape`
pub fn unescape(data: &mut [u8]) {
    BigEndian::write_u32(&mut data[0..4], JBD_MAGIC_NUMBER);
}
