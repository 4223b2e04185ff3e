//! Return codes of the `env` host functions.
//!
//! Every host function returns a `u32`. Sizes and HTTP statuses share the
//! value space with these sentinels, which occupy the top 16 values.

pub const SUCCESS: u32 = 0;

/// 1st argument unreadable (method, target type, path, worktree name).
pub const READ_ARG1_FAILED: u32 = 0xFFFF_FFF0;
/// 2nd argument unreadable (body, target id, worktree base path).
pub const READ_ARG2_FAILED: u32 = 0xFFFF_FFF1;
/// `set_working_directory`: no base directory to resolve a relative path.
pub const CWD_UNAVAILABLE: u32 = 0xFFFF_FFF1;
/// 3rd argument unreadable (headers, params).
pub const READ_ARG3_FAILED: u32 = 0xFFFF_FFF2;
/// `set_working_directory`: the directory could not be created.
pub const DIR_CREATE_FAILED: u32 = 0xFFFF_FFF2;
/// `create_git_worktree`: no base directory to create the worktree from.
pub const WORKTREE_BASE_UNAVAILABLE: u32 = 0xFFFF_FFF2;
/// `http_request_with_headers`: headers are not a JSON string map.
pub const PARSE_FAILED: u32 = 0xFFFF_FFF3;
/// `trigger_workflow_or_agent`: type is neither `workflow` nor `agent`.
pub const INVALID_TARGET_TYPE: u32 = 0xFFFF_FFF3;
/// `create_git_worktree`: base path has no `.git`.
pub const NOT_A_GIT_REPO: u32 = 0xFFFF_FFF3;
/// Nothing buffered yet for the getter.
pub const NO_RESULT: u32 = 0xFFFF_FFF4;
/// `trigger_workflow_or_agent`: params are not a JSON object.
pub const PARAMS_PARSE_FAILED: u32 = 0xFFFF_FFF4;
/// `create_git_worktree`: `git worktree add` failed.
pub const WORKTREE_ADD_FAILED: u32 = 0xFFFF_FFF4;
/// Caller's buffer cannot hold the value; probe again with the returned size.
pub const BUFFER_TOO_SMALL: u32 = 0xFFFF_FFF5;
pub const WRITE_FAILED: u32 = 0xFFFF_FFF6;
pub const READ_HEADER_NAME_FAILED: u32 = 0xFFFF_FFF7;
/// Job deadline passed; checked before any argument is read.
pub const CANCELLED: u32 = 0xFFFF_FFFA;
pub const READ_BODY_FAILED: u32 = 0xFFFF_FFFB;
pub const SEND_FAILED: u32 = 0xFFFF_FFFC;
/// Nested workflow or agent failed, or its result exceeds the buffer cap.
pub const NESTED_FAILED: u32 = 0xFFFF_FFFC;
pub const BUILD_FAILED: u32 = 0xFFFF_FFFD;
/// URL outside the allow-list (or unparsable), or a working-directory
/// change after the first step.
pub const NOT_PERMITTED: u32 = 0xFFFF_FFFE;
pub const READ_URL_FAILED: u32 = 0xFFFF_FFFF;

/// Codes used by the legacy `execute_target` entry point.
pub mod legacy {
    pub const PARSE_FAILED: u32 = 0xFFFF_FFF3;
    pub const INVALID_TYPE: u32 = 0xFFFF_FFF4;
    pub const FAILED: u32 = 0xFFFF_FFF5;
}

/// Status recorded for a successful `trigger_workflow_or_agent`.
pub const TRIGGER_OK_STATUS: u32 = 200;

/// Smallest sentinel value. Any return at or above it is an error code.
pub const SENTINEL_FLOOR: u32 = 0xFFFF_FFF0;

pub fn is_error(code: u32) -> bool {
    code >= SENTINEL_FLOOR
}
