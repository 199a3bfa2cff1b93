//! Raw MIPS I opcode and SPECIAL-function encodings, matching
//! `psx-instruction.h` from the original dynarec.

pub const OP_SPECIAL: u32 = 0x00;
pub const OP_BCOND: u32 = 0x01; // BLTZ/BGEZ/BLTZAL/BGEZAL
pub const OP_J: u32 = 0x02;
pub const OP_JAL: u32 = 0x03;
pub const OP_BEQ: u32 = 0x04;
pub const OP_BNE: u32 = 0x05;
pub const OP_BLEZ: u32 = 0x06;
pub const OP_BGTZ: u32 = 0x07;
pub const OP_ADDI: u32 = 0x08;
pub const OP_ADDIU: u32 = 0x09;
pub const OP_SLTI: u32 = 0x0A;
pub const OP_SLTIU: u32 = 0x0B;
pub const OP_ANDI: u32 = 0x0C;
pub const OP_ORI: u32 = 0x0D;
pub const OP_XORI: u32 = 0x0E;
pub const OP_LUI: u32 = 0x0F;
pub const OP_COP0: u32 = 0x10;
pub const OP_COP2: u32 = 0x12;
pub const OP_LB: u32 = 0x20;
pub const OP_LH: u32 = 0x21;
pub const OP_LWL: u32 = 0x22;
pub const OP_LW: u32 = 0x23;
pub const OP_LBU: u32 = 0x24;
pub const OP_LHU: u32 = 0x25;
pub const OP_LWR: u32 = 0x26;
pub const OP_SB: u32 = 0x28;
pub const OP_SH: u32 = 0x29;
pub const OP_SWL: u32 = 0x2A;
pub const OP_SW: u32 = 0x2B;
pub const OP_SWR: u32 = 0x2E;
pub const OP_LWC2: u32 = 0x32;
pub const OP_SWC2: u32 = 0x3A;

// SPECIAL (opcode 0) function field.
pub const FN_SLL: u32 = 0x00;
pub const FN_SRL: u32 = 0x02;
pub const FN_SRA: u32 = 0x03;
pub const FN_SLLV: u32 = 0x04;
pub const FN_SRLV: u32 = 0x06;
pub const FN_SRAV: u32 = 0x07;
pub const FN_JR: u32 = 0x08;
pub const FN_JALR: u32 = 0x09;
pub const FN_SYSCALL: u32 = 0x0C;
pub const FN_BREAK: u32 = 0x0D;
pub const FN_MFHI: u32 = 0x10;
pub const FN_MTHI: u32 = 0x11;
pub const FN_MFLO: u32 = 0x12;
pub const FN_MTLO: u32 = 0x13;
pub const FN_MULT: u32 = 0x18;
pub const FN_MULTU: u32 = 0x19;
pub const FN_DIV: u32 = 0x1A;
pub const FN_DIVU: u32 = 0x1B;
pub const FN_ADD: u32 = 0x20;
pub const FN_ADDU: u32 = 0x21;
pub const FN_SUB: u32 = 0x22;
pub const FN_SUBU: u32 = 0x23;
pub const FN_AND: u32 = 0x24;
pub const FN_OR: u32 = 0x25;
pub const FN_XOR: u32 = 0x26;
pub const FN_NOR: u32 = 0x27;
pub const FN_SLT: u32 = 0x2A;
pub const FN_SLTU: u32 = 0x2B;

/// Reserved SPECIAL-function encodings: always `#RI` (illegal
/// instruction), not "documented-illegal no-effect" like an unused
/// primary opcode.
pub const FN_RESERVED: [u32; 2] = [0x1F, 0x34];

// COP0 sub-opcode field (bits 25:21 of a COP0 instruction).
pub const COP_MF: u32 = 0x00;
pub const COP_MT: u32 = 0x04;
pub const COP_RFE_CO: u32 = 0x10; // CO bit set, function RFE below

pub const FN_RFE: u32 = 0x10;
