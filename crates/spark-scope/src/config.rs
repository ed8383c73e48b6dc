//! # 作用域管理器配置
//!
//! ## 定位（Why）
//! - 宿主通常在启动阶段从配置文件决定“默认是否迁移调用流”“回调 panic 如何处理”等策略；
//! - 配置只影响运行时策略，不改变作用域的排序与提交语义。
//!
//! ## 契约（What）
//! - [`ScopeSettings`] 派生 `serde::Deserialize`，未知字段直接拒绝，缺省字段取默认值；
//! - 启用 `toml-config` 特性（默认开启）时可通过 [`ScopeSettings::from_toml_str`] 加载，
//!   同时接受 `[scope]` 表与无表头的裸键值；
//! - 构造管理器前统一经过 [`ScopeSettings::validate`] 校验。

use serde::Deserialize;
use thiserror::Error;

use crate::{completion::ResolvePolicy, error::BoxError};

/// 配置错误。
#[derive(Debug, Error)]
pub enum SettingsError {
    /// 配置文本无法解析或字段类型不匹配。
    #[error("invalid scope settings: {0}")]
    Parse(#[source] BoxError),

    /// `callback_limit = 0` 会让任何回调都无法执行。
    #[error("callback_limit must be greater than zero")]
    ZeroCallbackLimit,
}

#[cfg(feature = "toml-config")]
impl From<toml::de::Error> for SettingsError {
    fn from(err: toml::de::Error) -> Self {
        SettingsError::Parse(Box::new(err))
    }
}

impl SettingsError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            SettingsError::Parse(_) => "scope.settings.parse",
            SettingsError::ZeroCallbackLimit => "scope.settings.zero_callback_limit",
        }
    }
}

/// 作用域管理器的运行时策略。
///
/// # 字段
/// - `default_migration`：`create_scope()` 是否默认迁移调用流，默认 `false`；
/// - `catch_callback_panics`：是否把完成回调中的 panic 转为失败记录，默认 `true`；
///   关闭后 panic 直接向调用 `dispose` 的一方传播；
/// - `force_clear_runs_callbacks`：作用域引用强制清理时是否以 `false` 执行回调，默认 `true`；
///   关闭后回调被直接丢弃；
/// - `callback_limit`：单次解析最多执行的回调数，默认不限；超出部分被丢弃并记为一条失败。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScopeSettings {
    pub default_migration: bool,
    pub catch_callback_panics: bool,
    pub force_clear_runs_callbacks: bool,
    pub callback_limit: Option<usize>,
}

impl Default for ScopeSettings {
    fn default() -> Self {
        Self {
            default_migration: false,
            catch_callback_panics: true,
            force_clear_runs_callbacks: true,
            callback_limit: None,
        }
    }
}

impl ScopeSettings {
    pub fn with_default_migration(mut self, migrate: bool) -> Self {
        self.default_migration = migrate;
        self
    }

    pub fn with_catch_callback_panics(mut self, catch: bool) -> Self {
        self.catch_callback_panics = catch;
        self
    }

    pub fn with_force_clear_runs_callbacks(mut self, run: bool) -> Self {
        self.force_clear_runs_callbacks = run;
        self
    }

    pub fn with_callback_limit(mut self, limit: Option<usize>) -> Self {
        self.callback_limit = limit;
        self
    }

    /// 校验取值组合是否可用。
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.callback_limit == Some(0) {
            return Err(SettingsError::ZeroCallbackLimit);
        }
        Ok(())
    }

    pub(crate) fn resolve_policy(&self) -> ResolvePolicy {
        ResolvePolicy {
            catch_panics: self.catch_callback_panics,
            limit: self.callback_limit,
        }
    }

    /// 从 TOML 文本加载并校验配置。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：若顶层只有一个名为 `scope` 的表，则读取该表；否则把整个文档视为配置表；
    /// - **错误**：语法错误、类型不匹配、未知字段返回 [`SettingsError::Parse`]，取值非法返回对应校验错误。
    #[cfg(feature = "toml-config")]
    pub fn from_toml_str(raw: &str) -> Result<Self, SettingsError> {
        let mut document: toml::Table = raw.parse()?;
        let table = match document.remove("scope") {
            Some(toml::Value::Table(scope)) if document.is_empty() => scope,
            Some(other) => {
                document.insert("scope".to_owned(), other);
                document
            }
            None => document,
        };
        let settings: ScopeSettings = toml::Value::Table(table).try_into()?;
        settings.validate()?;
        Ok(settings)
    }
}
