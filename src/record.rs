//! Restoration records: enough state to undo an installed hook.

/// The saved original bytes for one hook, sufficient to restore it.
#[derive(Debug, Clone)]
pub struct HookRecord<O = ()> {
    /// Address the jump patch was written over.
    pub target: usize,
    /// The policy blob this hook's request carried, forwarded back to the
    /// memory manager's `foreign_write_with_pc_patch` on restore.
    pub opt: O,
    /// The original bytes that were overwritten, saved before the patch was
    /// committed.
    pub saved_bytes: Box<[u8]>,
}

/// An owned block of restoration records produced by a successful
/// [`crate::install::install`] call with recording enabled.
///
/// This is a `Vec` of owned records rather than the original C
/// implementation's single packed `{header, bytes}*` byte buffer — there is
/// no ABI reason here to flatten the records into contiguous bytes, since
/// restoration happens entirely within this crate. [`HookRecord::encode`]
/// and [`decode_block`] are kept so a record block can still be serialized
/// to and parsed from that flat layout when it needs to cross a process or
/// ABI boundary; they're only defined for `O = ()` since `opt` is an opaque
/// per-process policy blob with no defined on-the-wire representation.
#[derive(Debug, Clone, Default)]
pub struct RecordBlock<O = ()> {
    pub records: Vec<HookRecord<O>>,
}

impl<O> RecordBlock<O> {
    pub fn new() -> Self {
        Self { records: Vec::new() }
    }

    pub fn push(&mut self, target: usize, opt: O, saved_bytes: Box<[u8]>) {
        self.records.push(HookRecord {
            target,
            opt,
            saved_bytes,
        });
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl HookRecord<()> {
    /// Encode as `{target: u64}{saved_byte_count: u32}{saved_bytes}`,
    /// matching the original implementation's flat per-record layout.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.target as u64).to_le_bytes());
        out.extend_from_slice(&(self.saved_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.saved_bytes);
    }
}

/// Parse a flat record block previously produced by repeated calls to
/// [`HookRecord::encode`].
pub fn decode_block(mut bytes: &[u8]) -> Option<RecordBlock<()>> {
    let mut block = RecordBlock::new();
    while !bytes.is_empty() {
        if bytes.len() < 12 {
            return None;
        }
        let target = u64::from_le_bytes(bytes[0..8].try_into().ok()?) as usize;
        let len = u32::from_le_bytes(bytes[8..12].try_into().ok()?) as usize;
        bytes = &bytes[12..];
        if bytes.len() < len {
            return None;
        }
        let saved_bytes = bytes[..len].to_vec().into_boxed_slice();
        bytes = &bytes[len..];
        block.push(target, (), saved_bytes);
    }
    Some(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips() {
        let mut block = RecordBlock::new();
        block.push(0x1000, (), vec![0xAA; 14].into_boxed_slice());
        block.push(0x2000, (), vec![0xBB; 5].into_boxed_slice());

        let mut flat = Vec::new();
        for r in &block.records {
            r.encode(&mut flat);
        }

        let decoded = decode_block(&flat).expect("valid block");
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.records[0].target, 0x1000);
        assert_eq!(&*decoded.records[0].saved_bytes, &[0xAA; 14][..]);
        assert_eq!(decoded.records[1].target, 0x2000);
        assert_eq!(&*decoded.records[1].saved_bytes, &[0xBB; 5][..]);
    }
}
