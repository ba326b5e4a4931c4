/// Tag constants.
const TAG_SHIFT: u32 = 48;
const PAYLOAD_MASK: u64 = (1 << TAG_SHIFT) - 1;
const INT48_TAG: u64 = 0xFFF9;
const UINT48_TAG: u64 = 0xFFFA;
const REF_TAG: u64 = 0xFFFB;
const PTR_TAG: u64 = 0xFFFC;

pub const INT48_MIN: i64 = -(1 << 47);
pub const INT48_MAX: i64 = (1 << 47) - 1;
pub const UINT48_MAX: u64 = PAYLOAD_MASK;

/// Which accessor is valid for a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Int48,
    Uint48,
    Ref,
    Ptr,
    /// Any word whose top 16 bits are not one of the boxing tags.
    Raw,
}

/// A reference to a heap cell.
///
/// `generation` distinguishes successive occupants of the same cell so a
/// reference that outlived its object is detected instead of aliasing the
/// next allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    index: u32,
    generation: u16,
}

impl ObjectRef {
    #[inline(always)]
    pub const fn new(index: u32, generation: u16) -> Self {
        Self { index, generation }
    }

    #[inline(always)]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline(always)]
    pub const fn generation(self) -> u16 {
        self.generation
    }

    #[inline(always)]
    const fn to_payload(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[inline(always)]
    const fn from_payload(payload: u64) -> Self {
        Self {
            index: payload as u32,
            generation: (payload >> 32) as u16,
        }
    }
}

/// A tagged 64-bit value.
///
/// Encoding (top 16 bits select the variant, low 48 bits are the payload):
/// - **Int48**:  `0xFFF9_XXXX_XXXX_XXXX`: signed, two's complement in 48 bits.
/// - **Uint48**: `0xFFFA_XXXX_XXXX_XXXX`: unsigned, used for function indices.
/// - **Ref**:    `0xFFFB_GGGG_IIII_IIII`: [`ObjectRef`] (generation, index).
/// - **Ptr**:    `0xFFFC_XXXX_XXXX_XXXX`: an untyped position; only the
///   interpreter's saved state uses it.
/// - anything else is a raw word.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Value(u64);

impl Value {
    /// Contents of a local slot that has not been written yet.
    pub const UNINITIALIZED: Value = Value(0);

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline(always)]
    const fn boxed(tag: u64, payload: u64) -> Self {
        Self((tag << TAG_SHIFT) | (payload & PAYLOAD_MASK))
    }

    #[inline(always)]
    const fn tag(self) -> u64 {
        self.0 >> TAG_SHIFT
    }

    #[inline(always)]
    const fn payload(self) -> u64 {
        self.0 & PAYLOAD_MASK
    }

    pub const fn kind(self) -> ValueKind {
        match self.tag() {
            INT48_TAG => ValueKind::Int48,
            UINT48_TAG => ValueKind::Uint48,
            REF_TAG => ValueKind::Ref,
            PTR_TAG => ValueKind::Ptr,
            _ => ValueKind::Raw,
        }
    }

    // ── Int48 ──────────────────────────────────────────────────────

    /// Box a signed integer, wrapping it into the 48-bit range.
    #[inline(always)]
    pub const fn from_int48(n: i64) -> Self {
        Self::boxed(INT48_TAG, n as u64)
    }

    #[inline(always)]
    pub const fn is_int48(self) -> bool {
        self.tag() == INT48_TAG
    }

    #[inline(always)]
    pub const fn as_int48(self) -> Option<i64> {
        if self.is_int48() {
            // sign-extend bit 47
            Some(((self.payload() << 16) as i64) >> 16)
        } else {
            None
        }
    }

    /// # Panics
    ///
    /// Panics if the value is not an Int48.
    #[inline(always)]
    #[track_caller]
    pub fn int48(self) -> i64 {
        match self.as_int48() {
            Some(n) => n,
            None => panic!("value is not an int48: {self:?}"),
        }
    }

    // ── Uint48 ─────────────────────────────────────────────────────

    #[inline(always)]
    pub const fn from_uint48(n: u64) -> Self {
        Self::boxed(UINT48_TAG, n)
    }

    #[inline(always)]
    pub const fn is_uint48(self) -> bool {
        self.tag() == UINT48_TAG
    }

    #[inline(always)]
    pub const fn as_uint48(self) -> Option<u64> {
        if self.is_uint48() {
            Some(self.payload())
        } else {
            None
        }
    }

    /// # Panics
    ///
    /// Panics if the value is not a Uint48.
    #[inline(always)]
    #[track_caller]
    pub fn uint48(self) -> u64 {
        match self.as_uint48() {
            Some(n) => n,
            None => panic!("value is not a uint48: {self:?}"),
        }
    }

    // ── Reference ──────────────────────────────────────────────────

    #[inline(always)]
    pub const fn from_ref(object: ObjectRef) -> Self {
        Self::boxed(REF_TAG, object.to_payload())
    }

    #[inline(always)]
    pub const fn is_ref(self) -> bool {
        self.tag() == REF_TAG
    }

    #[inline(always)]
    pub const fn as_object(self) -> Option<ObjectRef> {
        if self.is_ref() {
            Some(ObjectRef::from_payload(self.payload()))
        } else {
            None
        }
    }

    /// # Panics
    ///
    /// Panics if the value is not a reference.
    #[inline(always)]
    #[track_caller]
    pub fn object(self) -> ObjectRef {
        match self.as_object() {
            Some(r) => r,
            None => panic!("value is not a reference: {self:?}"),
        }
    }

    // ── Ptr ────────────────────────────────────────────────────────

    #[inline(always)]
    pub const fn from_ptr(position: usize) -> Self {
        Self::boxed(PTR_TAG, position as u64)
    }

    #[inline(always)]
    pub const fn is_ptr(self) -> bool {
        self.tag() == PTR_TAG
    }

    #[inline(always)]
    pub const fn as_ptr(self) -> Option<usize> {
        if self.is_ptr() {
            Some(self.payload() as usize)
        } else {
            None
        }
    }

    /// # Panics
    ///
    /// Panics if the value is not a ptr.
    #[inline(always)]
    #[track_caller]
    pub fn ptr(self) -> usize {
        match self.as_ptr() {
            Some(p) => p,
            None => panic!("value is not a ptr: {self:?}"),
        }
    }
}

impl From<ObjectRef> for Value {
    fn from(object: ObjectRef) -> Self {
        Value::from_ref(object)
    }
}

impl core::fmt::Debug for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.kind() {
            ValueKind::Int48 => write!(f, "Int48({})", self.int48()),
            ValueKind::Uint48 => write!(f, "Uint48({})", self.uint48()),
            ValueKind::Ref => {
                let r = self.object();
                write!(f, "Ref({}@{})", r.index(), r.generation())
            }
            ValueKind::Ptr => write!(f, "Ptr({})", self.ptr()),
            ValueKind::Raw => write!(f, "Raw(0x{:016x})", self.0),
        }
    }
}

impl core::fmt::Display for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.kind() {
            ValueKind::Int48 => write!(f, "{}", self.int48()),
            ValueKind::Uint48 => write!(f, "{}", self.uint48()),
            _ => write!(f, "{self:?}"),
        }
    }
}
