pub mod models;

/// 错误信息最大长度（字符数）
pub const ERROR_MESSAGE_LENGTH: usize = 2047;
/// 错误信息被截断时追加的固定后缀
pub const TRUNCATION_APPENDIX: &str = "...truncated";
/// 新作业的默认优先级，数值越小越先调度
pub const DEFAULT_PRIORITY: i8 = 3;
/// 环境变量前缀
pub const ENV_PREFIX: &str = "JOBREG";

/// 校验标识符只包含字母、数字和下划线，且不以数字开头
pub fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
