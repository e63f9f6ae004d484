/// A compiled program, ready to be loaded by the virtual machine.
///
/// `code` holds opcodes and inline operands, one per `i64` cell; `data` holds
/// string-literal bytes and zero-initialized global storage. `entry` is the
/// code index of the entry function, and `halt` points at the stub the VM
/// uses as the entry call's return address so that falling off the entry
/// function exits with its return value.
#[derive(Clone, Debug, Default)]
pub struct BytecodeProgram {
    pub code: Vec<i64>,
    pub data: Vec<u8>,
    pub entry: usize,
    pub halt: usize,
}
