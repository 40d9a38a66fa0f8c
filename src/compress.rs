//! An adaptive order-2 PPM range coder, the transport's default compressor.
//!
//! All model state lives in one flat symbol pool addressed by index, so a
//!  coder is a single allocation that resets per datagram. Each context
//!  keeps its symbols in a binary indexed tree so cumulative frequencies
//!  fall out of the search walk. The adaptation constants are tuned
//!  aggressively for small packet sizes rather than large file compression.

/// Per-datagram compression hook. `compress` returns the number of bytes
///  written to `out`, or 0 to send the data uncompressed; `decompress`
///  returns the decoded length, or 0 on corrupt input.
pub trait Compressor {
    fn compress(&mut self, in_buffers: &[&[u8]], out: &mut [u8]) -> usize;
    fn decompress(&mut self, in_data: &[u8], out: &mut [u8]) -> usize;
}

const RANGE_CODER_TOP: u32 = 1 << 24;
const RANGE_CODER_BOTTOM: u32 = 1 << 16;

const CONTEXT_SYMBOL_DELTA: u16 = 3;
const CONTEXT_SYMBOL_MINIMUM: u16 = 1;
const CONTEXT_ESCAPE_MINIMUM: u16 = 1;

const SUBCONTEXT_ORDER: usize = 2;
const SUBCONTEXT_SYMBOL_DELTA: u16 = 2;
const SUBCONTEXT_ESCAPE_DELTA: u16 = 5;

/// only enough symbols for reasonable MTUs; would need to be larger for
///  large-file compression
const SYMBOL_POOL_SIZE: usize = 4096;

/// the root context always occupies slot 0 of the pool
const ROOT: usize = 0;

#[derive(Debug, Clone, Copy, Default)]
struct Symbol {
    // binary indexed tree of symbols
    value: u8,
    count: u8,
    under: u16,
    left: u16,
    right: u16,

    // context defined by this symbol
    symbols: u16,
    escapes: u16,
    total: u16,
    parent: u16,
}

/// where to store the index of the symbol matched for the current byte,
///  chaining the per-order contexts together
enum ParentLink {
    Predicted,
    Symbol(usize),
}

pub struct RangeCoder {
    symbols: Box<[Symbol; SYMBOL_POOL_SIZE]>,
    next_symbol: usize,
    predicted: u16,
    order: usize,
}

impl RangeCoder {
    pub fn new() -> RangeCoder {
        RangeCoder {
            symbols: Box::new([Symbol::default(); SYMBOL_POOL_SIZE]),
            next_symbol: 0,
            predicted: 0,
            order: 0,
        }
    }

    fn create_symbol(&mut self, value: u8, count: u16) -> usize {
        let index = self.next_symbol;
        debug_assert!(index < SYMBOL_POOL_SIZE);
        self.next_symbol += 1;
        self.symbols[index] = Symbol {
            value,
            count: count as u8,
            under: count,
            ..Symbol::default()
        };
        index
    }

    fn create_context(&mut self, escapes: u16, minimum: u16) -> usize {
        let context = self.create_symbol(0, 0);
        self.symbols[context].escapes = escapes;
        self.symbols[context].total = escapes + 256 * minimum;
        self.symbols[context].symbols = 0;
        context
    }

    fn reset_model(&mut self) {
        self.next_symbol = 0;
        self.create_context(CONTEXT_ESCAPE_MINIMUM, CONTEXT_SYMBOL_MINIMUM);
        self.predicted = 0;
        self.order = 0;
    }

    /// recycle the pool once it cannot hold another full order chain
    fn free_symbols_if_needed(&mut self) {
        if self.next_symbol >= SYMBOL_POOL_SIZE - SUBCONTEXT_ORDER {
            self.reset_model();
        }
    }

    fn advance_order(&mut self) {
        if self.order >= SUBCONTEXT_ORDER {
            self.predicted = self.symbols[self.predicted as usize].parent;
        } else {
            self.order += 1;
        }
        self.free_symbols_if_needed();
    }

    fn set_parent(&mut self, link: &ParentLink, index: usize) {
        match link {
            ParentLink::Predicted => self.predicted = index as u16,
            ParentLink::Symbol(symbol) => self.symbols[*symbol].parent = index as u16,
        }
    }

    fn rescale_symbol(&mut self, mut symbol: usize) -> u16 {
        let mut total = 0u16;
        loop {
            let count = self.symbols[symbol].count;
            self.symbols[symbol].count = count - (count >> 1);
            self.symbols[symbol].under = self.symbols[symbol].count as u16;

            let left = self.symbols[symbol].left;
            if left != 0 {
                let left_total = self.rescale_symbol(left as usize);
                self.symbols[symbol].under = self.symbols[symbol].under.wrapping_add(left_total);
            }
            total = total.wrapping_add(self.symbols[symbol].under);

            let right = self.symbols[symbol].right;
            if right == 0 {
                break;
            }
            symbol = right as usize;
        }
        total
    }

    fn rescale_context(&mut self, context: usize, minimum: u16) {
        let symbols = self.symbols[context].symbols;
        let total = if symbols != 0 {
            self.rescale_symbol(symbols as usize)
        } else {
            0
        };
        let escapes = self.symbols[context].escapes;
        let escapes = escapes - (escapes >> 1);
        self.symbols[context].escapes = escapes;
        self.symbols[context].total = total.wrapping_add(escapes + 256 * minimum);
    }

    /// Looks up `value` in the context's tree, creating it if absent, and
    ///  returns `(symbol index, cumulative under, count)` for the coder.
    fn context_encode(
        &mut self,
        context: usize,
        value: u8,
        update: u16,
        minimum: u16,
    ) -> (usize, u16, u16) {
        let mut under = value as u16 * minimum;
        let count = minimum;

        if self.symbols[context].symbols == 0 {
            let symbol = self.create_symbol(value, update);
            self.symbols[context].symbols = symbol as u16;
            return (symbol, under, count);
        }

        let mut node = self.symbols[context].symbols as usize;
        loop {
            let node_value = self.symbols[node].value;
            if value < node_value {
                self.symbols[node].under = self.symbols[node].under.wrapping_add(update);
                if self.symbols[node].left != 0 {
                    node = self.symbols[node].left as usize;
                    continue;
                }
                let symbol = self.create_symbol(value, update);
                self.symbols[node].left = symbol as u16;
                return (symbol, under, count);
            } else if value > node_value {
                under = under.wrapping_add(self.symbols[node].under);
                if self.symbols[node].right != 0 {
                    node = self.symbols[node].right as usize;
                    continue;
                }
                let symbol = self.create_symbol(value, update);
                self.symbols[node].right = symbol as u16;
                return (symbol, under, count);
            } else {
                let node_count = self.symbols[node].count as u16;
                let count = count.wrapping_add(node_count);
                let under = under.wrapping_add(self.symbols[node].under.wrapping_sub(node_count));
                self.symbols[node].under = self.symbols[node].under.wrapping_add(update);
                self.symbols[node].count = (node_count + update) as u8;
                return (node, under, count);
            }
        }
    }

    /// Finds the symbol whose cumulative-frequency interval contains `code`.
    ///  In a subcontext (`root_minimum == None`) an unseen interval means the
    ///  stream is corrupt; at the root (`root_minimum == Some(_)`) it names a
    ///  byte value not seen before, and the symbol is created from the code.
    fn context_decode(
        &mut self,
        context: usize,
        code: u16,
        update: u16,
        root_minimum: Option<u16>,
    ) -> Option<(usize, u8, u16, u16)> {
        let minimum = root_minimum.unwrap_or(0);
        let mut under = 0u16;
        let count = minimum;

        if self.symbols[context].symbols == 0 {
            let minimum = root_minimum?;
            let value = (code / minimum) as u8;
            under = code - code % minimum;
            let symbol = self.create_symbol(value, update);
            self.symbols[context].symbols = symbol as u16;
            return Some((symbol, value, under, count));
        }

        let mut node = self.symbols[context].symbols as usize;
        loop {
            let node_value = self.symbols[node].value as u16;
            let after = under
                .wrapping_add(self.symbols[node].under)
                .wrapping_add((node_value + 1).wrapping_mul(minimum));
            let before = (self.symbols[node].count as u16).wrapping_add(minimum);

            if code >= after {
                under = under.wrapping_add(self.symbols[node].under);
                if self.symbols[node].right != 0 {
                    node = self.symbols[node].right as usize;
                    continue;
                }
                let minimum = root_minimum?;
                let value = (node_value + 1 + (code - after) / minimum) as u8;
                let under = code - (code - after) % minimum;
                let symbol = self.create_symbol(value, update);
                self.symbols[node].right = symbol as u16;
                return Some((symbol, value, under, count));
            } else if code < after.wrapping_sub(before) {
                self.symbols[node].under = self.symbols[node].under.wrapping_add(update);
                if self.symbols[node].left != 0 {
                    node = self.symbols[node].left as usize;
                    continue;
                }
                let minimum = root_minimum?;
                let gap = after.wrapping_sub(before).wrapping_sub(code).wrapping_sub(1);
                let value = node_value.wrapping_sub(1).wrapping_sub(gap / minimum) as u8;
                let under = code.wrapping_sub(gap % minimum);
                let symbol = self.create_symbol(value, update);
                self.symbols[node].left = symbol as u16;
                return Some((symbol, value, under, count));
            } else {
                let value = self.symbols[node].value;
                let node_count = self.symbols[node].count as u16;
                let count = count.wrapping_add(node_count);
                let under = after.wrapping_sub(before);
                self.symbols[node].under = self.symbols[node].under.wrapping_add(update);
                self.symbols[node].count = (node_count + update) as u8;
                return Some((node, value, under, count));
            }
        }
    }
}

impl Default for RangeCoder {
    fn default() -> Self {
        Self::new()
    }
}

struct Encoder<'a> {
    low: u32,
    range: u32,
    out: &'a mut [u8],
    position: usize,
}

impl Encoder<'_> {
    fn output(&mut self, value: u8) -> Option<()> {
        if self.position >= self.out.len() {
            return None;
        }
        self.out[self.position] = value;
        self.position += 1;
        Some(())
    }

    fn encode(&mut self, under: u16, count: u16, total: u16) -> Option<()> {
        self.range /= total as u32;
        self.low = self.low.wrapping_add((under as u32).wrapping_mul(self.range));
        self.range = self.range.wrapping_mul(count as u32);
        loop {
            if (self.low ^ self.low.wrapping_add(self.range)) >= RANGE_CODER_TOP {
                if self.range >= RANGE_CODER_BOTTOM {
                    break;
                }
                self.range = self.low.wrapping_neg() & (RANGE_CODER_BOTTOM - 1);
            }
            self.output((self.low >> 24) as u8)?;
            self.range <<= 8;
            self.low <<= 8;
        }
        Some(())
    }

    fn flush(&mut self) -> Option<()> {
        while self.low != 0 {
            self.output((self.low >> 24) as u8)?;
            self.low <<= 8;
        }
        Some(())
    }
}

struct Decoder<'a> {
    low: u32,
    code: u32,
    range: u32,
    input: &'a [u8],
    position: usize,
}

impl Decoder<'_> {
    fn next_input(&mut self) -> u32 {
        // past the end of the stream, zero bits are shifted in; the encoder's
        //  flush guarantees they decode as the terminating root escape
        if self.position < self.input.len() {
            let byte = self.input[self.position];
            self.position += 1;
            byte as u32
        } else {
            0
        }
    }

    fn seed(&mut self) {
        self.code |= self.next_input() << 24;
        self.code |= self.next_input() << 16;
        self.code |= self.next_input() << 8;
        self.code |= self.next_input();
    }

    fn read(&mut self, total: u16) -> Option<u16> {
        self.range /= total as u32;
        if self.range == 0 {
            return None;
        }
        Some((self.code.wrapping_sub(self.low) / self.range) as u16)
    }

    fn decode(&mut self, under: u16, count: u16) -> Option<()> {
        self.low = self.low.wrapping_add((under as u32).wrapping_mul(self.range));
        self.range = self.range.wrapping_mul(count as u32);
        loop {
            if (self.low ^ self.low.wrapping_add(self.range)) >= RANGE_CODER_TOP {
                if self.range >= RANGE_CODER_BOTTOM {
                    break;
                }
                self.range = self.low.wrapping_neg() & (RANGE_CODER_BOTTOM - 1);
                if self.range == 0 {
                    return None;
                }
            }
            self.code = (self.code << 8) | self.next_input();
            self.range <<= 8;
            self.low <<= 8;
        }
        Some(())
    }
}

impl Compressor for RangeCoder {
    fn compress(&mut self, in_buffers: &[&[u8]], out: &mut [u8]) -> usize {
        if in_buffers.iter().all(|b| b.is_empty()) {
            return 0;
        }

        self.reset_model();

        let mut encoder = Encoder {
            low: 0,
            range: !0,
            out,
            position: 0,
        };

        for value in in_buffers.iter().flat_map(|b| b.iter().copied()) {
            match self.encode_value(&mut encoder, value) {
                Some(()) => {}
                None => return 0,
            }
        }

        if encoder.flush().is_none() {
            return 0;
        }
        encoder.position
    }

    fn decompress(&mut self, in_data: &[u8], out: &mut [u8]) -> usize {
        if in_data.is_empty() {
            return 0;
        }

        self.reset_model();

        let mut decoder = Decoder {
            low: 0,
            code: 0,
            range: !0,
            input: in_data,
            position: 0,
        };
        decoder.seed();

        let mut out_position = 0;
        loop {
            match self.decode_value(&mut decoder) {
                DecodeStep::Value(value) => {
                    if out_position >= out.len() {
                        return 0;
                    }
                    out[out_position] = value;
                    out_position += 1;
                }
                DecodeStep::EndOfStream => break,
                DecodeStep::Corrupt => return 0,
            }
        }

        out_position
    }
}

enum DecodeStep {
    Value(u8),
    EndOfStream,
    Corrupt,
}

impl RangeCoder {
    fn encode_value(&mut self, encoder: &mut Encoder, value: u8) -> Option<()> {
        let mut link = ParentLink::Predicted;
        let mut encoded_in_subcontext = false;

        let mut subcontext = self.predicted as usize;
        while subcontext != ROOT {
            let (symbol, under, count) =
                self.context_encode(subcontext, value, SUBCONTEXT_SYMBOL_DELTA, 0);
            self.set_parent(&link, symbol);
            link = ParentLink::Symbol(symbol);

            let total = self.symbols[subcontext].total;
            if count > 0 {
                encoder.encode(self.symbols[subcontext].escapes.wrapping_add(under), count, total)?;
            } else {
                let escapes = self.symbols[subcontext].escapes;
                if escapes > 0 && escapes < total {
                    encoder.encode(0, escapes, total)?;
                }
                self.symbols[subcontext].escapes += SUBCONTEXT_ESCAPE_DELTA;
                self.symbols[subcontext].total += SUBCONTEXT_ESCAPE_DELTA;
            }
            self.symbols[subcontext].total += SUBCONTEXT_SYMBOL_DELTA;
            if count > 0xFF - 2 * SUBCONTEXT_SYMBOL_DELTA
                || self.symbols[subcontext].total > (RANGE_CODER_BOTTOM - 0x100) as u16
            {
                self.rescale_context(subcontext, 0);
            }

            if count > 0 {
                encoded_in_subcontext = true;
                break;
            }
            subcontext = self.symbols[subcontext].parent as usize;
        }

        if !encoded_in_subcontext {
            let (symbol, under, count) =
                self.context_encode(ROOT, value, CONTEXT_SYMBOL_DELTA, CONTEXT_SYMBOL_MINIMUM);
            self.set_parent(&link, symbol);

            let total = self.symbols[ROOT].total;
            encoder.encode(self.symbols[ROOT].escapes.wrapping_add(under), count, total)?;
            self.symbols[ROOT].total += CONTEXT_SYMBOL_DELTA;
            if count > 0xFF - 2 * CONTEXT_SYMBOL_DELTA + CONTEXT_SYMBOL_MINIMUM
                || self.symbols[ROOT].total > (RANGE_CODER_BOTTOM - 0x100) as u16
            {
                self.rescale_context(ROOT, CONTEXT_SYMBOL_MINIMUM);
            }
        }

        self.advance_order();
        Some(())
    }

    fn decode_value(&mut self, decoder: &mut Decoder) -> DecodeStep {
        let mut link = ParentLink::Predicted;
        let mut decoded: Option<(usize, u8)> = None;

        let mut subcontext = self.predicted as usize;
        while subcontext != ROOT {
            if self.symbols[subcontext].escapes == 0 {
                subcontext = self.symbols[subcontext].parent as usize;
                continue;
            }
            let total = self.symbols[subcontext].total;
            if self.symbols[subcontext].escapes >= total {
                subcontext = self.symbols[subcontext].parent as usize;
                continue;
            }

            let code = match decoder.read(total) {
                Some(code) => code,
                None => return DecodeStep::Corrupt,
            };
            let escapes = self.symbols[subcontext].escapes;
            if code < escapes {
                if decoder.decode(0, escapes).is_none() {
                    return DecodeStep::Corrupt;
                }
                subcontext = self.symbols[subcontext].parent as usize;
                continue;
            }
            let code = code - escapes;

            let (symbol, value, under, count) =
                match self.context_decode(subcontext, code, SUBCONTEXT_SYMBOL_DELTA, None) {
                    Some(result) => result,
                    None => return DecodeStep::Corrupt,
                };
            if decoder.decode(escapes.wrapping_add(under), count).is_none() {
                return DecodeStep::Corrupt;
            }
            self.symbols[subcontext].total += SUBCONTEXT_SYMBOL_DELTA;
            if count > 0xFF - 2 * SUBCONTEXT_SYMBOL_DELTA
                || self.symbols[subcontext].total > (RANGE_CODER_BOTTOM - 0x100) as u16
            {
                self.rescale_context(subcontext, 0);
            }

            decoded = Some((symbol, value));
            break;
        }

        let (bottom, value) = match decoded {
            Some(result) => result,
            None => {
                let total = self.symbols[ROOT].total;
                let code = match decoder.read(total) {
                    Some(code) => code,
                    None => return DecodeStep::Corrupt,
                };
                let escapes = self.symbols[ROOT].escapes;
                if code < escapes {
                    if decoder.decode(0, escapes).is_none() {
                        return DecodeStep::Corrupt;
                    }
                    return DecodeStep::EndOfStream;
                }
                let code = code - escapes;

                let (symbol, value, under, count) = match self.context_decode(
                    ROOT,
                    code,
                    CONTEXT_SYMBOL_DELTA,
                    Some(CONTEXT_SYMBOL_MINIMUM),
                ) {
                    Some(result) => result,
                    None => return DecodeStep::Corrupt,
                };
                if decoder.decode(escapes.wrapping_add(under), count).is_none() {
                    return DecodeStep::Corrupt;
                }
                self.symbols[ROOT].total += CONTEXT_SYMBOL_DELTA;
                if count > 0xFF - 2 * CONTEXT_SYMBOL_DELTA + CONTEXT_SYMBOL_MINIMUM
                    || self.symbols[ROOT].total > (RANGE_CODER_BOTTOM - 0x100) as u16
                {
                    self.rescale_context(ROOT, CONTEXT_SYMBOL_MINIMUM);
                }

                subcontext = ROOT;
                (symbol, value)
            }
        };

        // bring the contexts that escaped (or were skipped) up to date with
        //  the decoded value, chaining their symbols as the new prediction
        let mut patch = self.predicted as usize;
        while patch != subcontext {
            let (symbol, _, count) = self.context_encode(patch, value, SUBCONTEXT_SYMBOL_DELTA, 0);
            self.set_parent(&link, symbol);
            link = ParentLink::Symbol(symbol);

            if count == 0 {
                self.symbols[patch].escapes += SUBCONTEXT_ESCAPE_DELTA;
                self.symbols[patch].total += SUBCONTEXT_ESCAPE_DELTA;
            }
            self.symbols[patch].total += SUBCONTEXT_SYMBOL_DELTA;
            if count > 0xFF - 2 * SUBCONTEXT_SYMBOL_DELTA
                || self.symbols[patch].total > (RANGE_CODER_BOTTOM - 0x100) as u16
            {
                self.rescale_context(patch, 0);
            }

            patch = self.symbols[patch].parent as usize;
        }
        self.set_parent(&link, bottom);

        self.advance_order();
        DecodeStep::Value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn roundtrip(data: &[u8]) {
        let mut coder = RangeCoder::new();
        // same generous output budget the receive path grants
        let mut compressed = vec![0u8; data.len() * 2 + 64];
        let compressed_len = coder.compress(&[data], &mut compressed);
        assert!(compressed_len > 0);

        let mut decompressed = vec![0u8; data.len() + 64];
        let decompressed_len =
            coder.decompress(&compressed[..compressed_len], &mut decompressed);
        assert_eq!(decompressed_len, data.len());
        assert_eq!(&decompressed[..decompressed_len], data);
    }

    #[rstest]
    #[case::single_byte(vec![42])]
    #[case::repetitive(vec![7; 500])]
    #[case::text(b"the quick brown fox jumps over the lazy dog, the quick brown fox jumps again and again and again".to_vec())]
    #[case::all_byte_values((0..=255u8).collect::<Vec<u8>>())]
    #[case::sawtooth((0..2000).map(|i| (i % 7) as u8).collect::<Vec<u8>>())]
    fn test_roundtrip(#[case] data: Vec<u8>) {
        roundtrip(&data);
    }

    #[test]
    fn test_roundtrip_pseudo_random() {
        // LCG noise; must survive the trip even if it does not shrink
        let mut state = 0x12345678u32;
        let data: Vec<u8> = (0..1500)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 24) as u8
            })
            .collect();
        roundtrip(&data);
    }

    #[test]
    fn test_repetitive_data_shrinks() {
        let mut coder = RangeCoder::new();
        let data = vec![0xAB; 1400];
        let mut out = vec![0u8; data.len()];
        let compressed_len = coder.compress(&[&data], &mut out);
        assert!(compressed_len > 0);
        assert!(compressed_len < data.len() / 4);
    }

    #[test]
    fn test_gather_list_equals_catenation() {
        let a = b"hello hello hello ".as_slice();
        let b = b"world world world".as_slice();
        let catenated: Vec<u8> = [a, b].concat();

        let mut coder = RangeCoder::new();
        let mut out_gather = vec![0u8; 256];
        let gather_len = coder.compress(&[a, b], &mut out_gather);

        let mut out_single = vec![0u8; 256];
        let single_len = coder.compress(&[&catenated], &mut out_single);

        assert_eq!(gather_len, single_len);
        assert_eq!(out_gather[..gather_len], out_single[..single_len]);
    }

    #[test]
    fn test_compress_rejects_when_out_too_small() {
        let mut coder = RangeCoder::new();
        let mut state = 0x9E3779B9u32;
        let data: Vec<u8> = (0..512)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 24) as u8
            })
            .collect();
        // random noise cannot fit into a quarter of its own size
        let mut out = vec![0u8; data.len() / 4];
        assert_eq!(coder.compress(&[&data], &mut out), 0);
    }

    #[test]
    fn test_empty_input() {
        let mut coder = RangeCoder::new();
        let mut out = vec![0u8; 16];
        assert_eq!(coder.compress(&[], &mut out), 0);
        assert_eq!(coder.compress(&[b"".as_slice()], &mut out), 0);
        assert_eq!(coder.decompress(&[], &mut out), 0);
    }

    #[test]
    fn test_decompress_garbage_does_not_panic() {
        let mut coder = RangeCoder::new();
        let mut out = vec![0u8; 64];
        let garbage = [0xFFu8; 32];
        // any result is fine as long as it terminates cleanly
        let _ = coder.decompress(&garbage, &mut out);
    }
}
