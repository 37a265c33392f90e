//! The C ABI external compiler libraries export.
//!
//! The boundary is deliberately narrow: only opaque handles, C strings
//! and `(ptr, len)` byte ranges cross it, and every allocation is freed by
//! the side that produced it through an explicit vtable entry. Libraries
//! export four well-known symbols:
//!
//! * `GetCompilerDesc` — static description of the supported file kinds
//! * `CreateCompileOperation` — one compile request, returned as a handle
//!   whose first fields form its vtable
//! * `GetVersionInformation` — build version / date strings
//! * `AttachLibrary` / `DetachLibrary` — lifecycle hooks

use std::os::raw::c_char;

/// Bumped whenever any `Raw*` layout changes.
pub const ABI_VERSION: u32 = 1;

pub const SYM_GET_COMPILER_DESC: &[u8] = b"GetCompilerDesc\0";
pub const SYM_CREATE_COMPILE_OPERATION: &[u8] = b"CreateCompileOperation\0";
pub const SYM_GET_VERSION_INFORMATION: &[u8] = b"GetVersionInformation\0";
pub const SYM_ATTACH_LIBRARY: &[u8] = b"AttachLibrary\0";
pub const SYM_DETACH_LIBRARY: &[u8] = b"DetachLibrary\0";

/// One file kind a compiler supports: a file extension plus the bitmask
/// of target type codes it can produce for it.
#[repr(C)]
pub struct RawFileKind {
    pub extension: *const c_char,
    pub type_mask: u64,
}

/// Static description returned by `GetCompilerDesc`. The storage belongs
/// to the library and must stay valid until `DetachLibrary`.
#[repr(C)]
pub struct RawCompilerDesc {
    pub name: *const c_char,
    pub file_kinds: *const RawFileKind,
    pub file_kind_count: u32,
}

/// Version strings returned by `GetVersionInformation`; both point at
/// static storage inside the library.
#[repr(C)]
pub struct RawVersionInfo {
    pub version: *const c_char,
    pub build_date: *const c_char,
}

/// Services offered to the library during `AttachLibrary`. The pointer is
/// only valid for the duration of the call.
#[repr(C)]
pub struct RawLibraryGlobals {
    pub abi_version: u32,
    pub log: Option<unsafe extern "C" fn(level: i32, message: *const c_char)>,
}

/// One target a compile operation can serialize.
#[repr(C)]
pub struct RawTargetDesc {
    pub type_code: u64,
    pub name: *const c_char,
}

/// One serialized chunk. `name` and `data` belong to the chunk list that
/// carries them.
#[repr(C)]
pub struct RawChunk {
    pub type_id: u64,
    pub version: u32,
    pub name: *const c_char,
    pub data: *const u8,
    pub data_len: usize,
}

/// A set of chunks produced by `serialize_target`. The callee fills the
/// struct and installs `release`; the caller must invoke `release` exactly
/// once after copying the data out.
#[repr(C)]
pub struct RawChunkList {
    pub chunks: *const RawChunk,
    pub count: u32,
    pub release: Option<unsafe extern "C" fn(list: *mut RawChunkList)>,
}

impl RawChunkList {
    pub const fn empty() -> Self {
        Self { chunks: std::ptr::null(), count: 0, release: None }
    }
}

/// A list of dependency paths reported by an operation, same ownership
/// discipline as [`RawChunkList`].
#[repr(C)]
pub struct RawPathList {
    pub paths: *const *const c_char,
    pub count: u32,
    pub release: Option<unsafe extern "C" fn(list: *mut RawPathList)>,
}

impl RawPathList {
    pub const fn empty() -> Self {
        Self { paths: std::ptr::null(), count: 0, release: None }
    }
}

/// A compile operation handle. `CreateCompileOperation` returns a pointer
/// to this struct (usually embedded at the head of a larger library-side
/// object); the function pointers receive that same pointer back.
///
/// `list_dependencies` is optional; everything else is mandatory. The
/// caller finishes by invoking `dispose`, after which the handle is dead.
#[repr(C)]
pub struct RawCompileOperation {
    pub target_count: unsafe extern "C" fn(op: *mut RawCompileOperation) -> u32,
    pub get_target: unsafe extern "C" fn(op: *mut RawCompileOperation, index: u32) -> RawTargetDesc,
    /// Returns 0 on success and fills `out`; nonzero means the target
    /// could not be serialized.
    pub serialize_target: unsafe extern "C" fn(
        op: *mut RawCompileOperation,
        index: u32,
        out: *mut RawChunkList,
    ) -> i32,
    pub list_dependencies: Option<
        unsafe extern "C" fn(op: *mut RawCompileOperation, out: *mut RawPathList) -> i32,
    >,
    pub dispose: unsafe extern "C" fn(op: *mut RawCompileOperation),
}

pub type GetCompilerDescFn = unsafe extern "C" fn() -> *const RawCompilerDesc;
pub type CreateCompileOperationFn =
    unsafe extern "C" fn(identifier: *const c_char) -> *mut RawCompileOperation;
pub type GetVersionInformationFn = unsafe extern "C" fn() -> RawVersionInfo;
pub type AttachLibraryFn = unsafe extern "C" fn(globals: *const RawLibraryGlobals) -> i32;
pub type DetachLibraryFn = unsafe extern "C" fn();
