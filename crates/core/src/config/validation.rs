use super::{ConfigError, ConfigResult};

/// 配置校验
pub trait ConfigValidator {
    fn validate(&self) -> ConfigResult<()>;
}

pub struct ValidationUtils;

impl ValidationUtils {
    pub fn validate_not_empty(value: &str, field: &str) -> ConfigResult<()> {
        if value.trim().is_empty() {
            return Err(ConfigError::Validation(format!("{field} 不能为空")));
        }
        Ok(())
    }

    /// 秒数必须在 (0, 3600] 之内
    pub fn validate_timeout_seconds(value: u64, field: &str) -> ConfigResult<()> {
        if value == 0 || value > 3600 {
            return Err(ConfigError::Validation(format!(
                "{field} 必须在 1 到 3600 秒之间, 当前值: {value}"
            )));
        }
        Ok(())
    }

    pub fn validate_count(value: usize, field: &str, max: usize) -> ConfigResult<()> {
        if value == 0 || value > max {
            return Err(ConfigError::Validation(format!(
                "{field} 必须在 1 到 {max} 之间, 当前值: {value}"
            )));
        }
        Ok(())
    }

    pub fn validate_one_of(value: &str, field: &str, allowed: &[&str]) -> ConfigResult<()> {
        if !allowed.contains(&value) {
            return Err(ConfigError::Validation(format!(
                "{field} 的取值 {value} 无效, 可选值: {allowed:?}"
            )));
        }
        Ok(())
    }
}
