//! # Disassembly Module
//!
//! Turns debuggee machine code into readable x86_64 assembly with iced-x86.
//!
//! The bytes handed to [`Disassembly::disassemble`] should be the original program bytes, with
//! the `int3` of installed breakpoints already replaced by the bytes they saved
//! ([`Inferior::disassemble`](crate::inferior::Inferior::disassemble) does that). Instructions
//! starting at a breakpoint are marked instead.

use std::fmt::{Display, Write};

use iced_x86::{
    Decoder, DecoderOptions, Formatter, FormatterOutput, FormatterTextKind, Instruction,
    NasmFormatter,
};
use serde::{Serialize, Serializer};

use crate::Addr;

const CODE_BITNESS: u32 = 64;

/// A piece of formatted assembly and what kind of token it is
///
/// Front ends can use the kind to color the output.
pub type TextContent = (String, FormatterTextKind);

/// Collects the tokens the formatter produces for one instruction
struct TokenSink(Vec<TextContent>);

impl FormatterOutput for TokenSink {
    fn write(&mut self, text: &str, kind: FormatterTextKind) {
        self.0.push((text.to_string(), kind));
    }
}

/// One decoded instruction
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize)]
pub struct DisassembledInstruction {
    pub addr: Addr,
    pub bytes: Vec<u8>,
    #[serde(serialize_with = "serialize_tokens")]
    pub text: Vec<TextContent>,
    /// a breakpoint is set on the first byte of this instruction
    pub breakpoint: bool,
}

impl DisassembledInstruction {
    /// The assembly without token kinds
    pub fn assembly(&self) -> String {
        self.text.iter().map(|(t, _)| t.as_str()).collect()
    }
}

#[derive(Debug, Clone, Default, Hash, PartialEq, Eq, Serialize)]
pub struct Disassembly {
    instructions: Vec<DisassembledInstruction>,
}

fn formatter() -> NasmFormatter {
    let mut formatter = NasmFormatter::new();
    let options = formatter.options_mut();
    options.set_first_operand_char_index(10);
    options.set_hex_suffix("");
    options.set_hex_prefix("0x");
    options.set_uppercase_hex(false);
    options.set_show_symbol_address(true);
    options.set_rip_relative_addresses(false);
    options.set_memory_size_options(iced_x86::MemorySizeOptions::Always);
    formatter
}

impl Disassembly {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Decodes `data`, which starts at `first_addr`
    ///
    /// `breakpoints` are the addresses with a breakpoint, instructions starting there get
    /// [`DisassembledInstruction::breakpoint`] set. A trailing partial instruction is decoded as
    /// `(bad)`.
    pub fn disassemble(data: &[u8], first_addr: Addr, breakpoints: &[Addr]) -> Self {
        let mut decoder =
            Decoder::with_ip(CODE_BITNESS, data, first_addr.into(), DecoderOptions::NONE);
        let mut formatter = formatter();
        let mut instruction = Instruction::default();
        let mut instructions = Vec::new();

        while decoder.can_decode() {
            let start = decoder.position();
            decoder.decode_out(&mut instruction);
            let mut sink = TokenSink(Vec::new());
            formatter.format(&instruction, &mut sink);

            let addr = first_addr + start;
            instructions.push(DisassembledInstruction {
                addr,
                bytes: data[start..decoder.position()].to_vec(),
                text: sink.0,
                breakpoint: breakpoints.contains(&addr),
            });
        }

        Self { instructions }
    }

    pub fn instructions(&self) -> &[DisassembledInstruction] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

/// Length of the instruction starting with `bytes`, [`None`] if they do not decode
pub fn instruction_len(bytes: &[u8], addr: Addr) -> Option<usize> {
    let mut decoder = Decoder::with_ip(CODE_BITNESS, bytes, addr.into(), DecoderOptions::NONE);
    let instruction = decoder.decode();
    (!instruction.is_invalid()).then(|| instruction.len())
}

impl Display for Disassembly {
    /// One instruction per line:
    ///
    /// ```text
    /// 0x0000000000401000     55                      push      rbp
    /// 0x0000000000401004 (*) b8 01 00 00 00          mov       eax,1
    /// ```
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut raw = String::new();
        for instruction in &self.instructions {
            raw.clear();
            for byte in &instruction.bytes {
                write!(raw, "{byte:02x} ")?;
            }
            writeln!(
                f,
                "{} {:<4}{raw:<24}{}",
                instruction.addr,
                if instruction.breakpoint { "(*)" } else { "" },
                instruction.assembly()
            )?;
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct SerializableToken<'a> {
    text: &'a str,
    kind: String,
}

fn serialize_tokens<S>(tokens: &[TextContent], serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let tokens: Vec<SerializableToken> = tokens
        .iter()
        .map(|(text, kind)| SerializableToken {
            text,
            kind: format!("{kind:?}"),
        })
        .collect();
    tokens.serialize(serializer)
}
