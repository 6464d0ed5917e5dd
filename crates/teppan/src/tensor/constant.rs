/// # Constants with reserved meanings in teppan

/// In a model activation shape, the `0th` dimension is the batch slot
pub const BATCH_DIM: usize = 0;

/// In a model activation shape, the `1st` dimension is the sequence position
pub const SEQ_DIM: usize = 1;

/// Byte alignment of every host buffer a tensor allocates
pub const ALIGNMENT: usize = 64;

/// Width, in `f32` lanes, of the vectorized host loops
pub const SIMD_WIDTH: usize = 8;
