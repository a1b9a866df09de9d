//! 错误类型
//!
//! `ClientError` 描述存储后端返回的错误，`MirrorError` 描述镜像过程中
//! 每个路径上产生的错误（策略错误 + 执行错误）。

use thiserror::Error;

/// 存储客户端错误
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// 路径不存在
    #[error("路径不存在: {0}")]
    PathNotFound(String),

    /// 权限不足
    #[error("权限不足: {0}")]
    PathInsufficientPermission(String),

    /// 对象已存在
    #[error("对象已存在: {0}")]
    ObjectAlreadyExists(String),

    /// 对象已存在且是目录
    #[error("对象已存在且是目录: {0}")]
    ObjectAlreadyExistsAsDirectory(String),

    /// 对象在列举后消失
    #[error("对象不存在: {0}")]
    ObjectMissing(String),

    /// 存储桶不存在
    #[error("存储桶不存在: {0}")]
    BucketDoesNotExist(String),

    /// 未指定存储桶
    #[error("未指定存储桶")]
    BucketNameEmpty,

    /// 后端不支持该操作
    #[error("不支持的操作: {0}")]
    NotImplemented(String),

    /// 参数错误
    #[error("参数错误: {0}")]
    InvalidArgument(String),

    /// 列举结果未按字典序排列
    #[error("列举结果未排序: `{previous}` 之后出现 `{current}`")]
    UnsortedListing { previous: String, current: String },

    /// 操作已取消
    #[error("操作已取消")]
    Cancelled,

    /// 本地 IO 错误
    #[error("IO 错误: {0}")]
    Io(String),

    /// 其他后端错误
    #[error("存储错误: {0}")]
    Backend(String),
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => ClientError::PathNotFound(e.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                ClientError::PathInsufficientPermission(e.to_string())
            }
            std::io::ErrorKind::AlreadyExists => ClientError::ObjectAlreadyExists(e.to_string()),
            _ => ClientError::Io(e.to_string()),
        }
    }
}

impl From<opendal::Error> for ClientError {
    fn from(e: opendal::Error) -> Self {
        match e.kind() {
            opendal::ErrorKind::NotFound => ClientError::PathNotFound(e.to_string()),
            opendal::ErrorKind::PermissionDenied => {
                ClientError::PathInsufficientPermission(e.to_string())
            }
            opendal::ErrorKind::AlreadyExists => ClientError::ObjectAlreadyExists(e.to_string()),
            opendal::ErrorKind::IsADirectory => {
                ClientError::ObjectAlreadyExistsAsDirectory(e.to_string())
            }
            opendal::ErrorKind::Unsupported => ClientError::NotImplemented(e.to_string()),
            _ => ClientError::Backend(e.to_string()),
        }
    }
}

/// 镜像任务错误
#[derive(Error, Debug, Clone)]
pub enum MirrorError {
    /// 目标已存在且内容不同，但未开启覆盖
    #[error("不允许覆盖 `{0}`，使用 `--overwrite` 以覆盖目标")]
    OverwriteNotAllowed(String),

    /// 目标类型与源不一致（文件/目录）
    #[error("无效的目标 `{0}`")]
    InvalidTarget(String),

    /// 源无效
    #[error("无效的源 `{0}`")]
    InvalidSource(String),

    /// 比较器返回了无法识别的差异
    #[error("无法识别的差异类型: {0}")]
    UnrecognizedDiffType(String),

    /// 列举源或目标失败
    #[error("列举失败 ({url}): {source}")]
    Listing {
        url: String,
        #[source]
        source: ClientError,
    },

    /// 存储客户端错误
    #[error(transparent)]
    Client(#[from] ClientError),
}

impl MirrorError {
    /// 非关键错误：记录后继续处理其余文件，不计入失败
    pub fn is_ignored(&self) -> bool {
        matches!(
            self,
            MirrorError::Client(
                ClientError::PathNotFound(_)
                    | ClientError::ObjectMissing(_)
                    | ClientError::ObjectAlreadyExists(_)
                    | ClientError::ObjectAlreadyExistsAsDirectory(_)
                    | ClientError::BucketDoesNotExist(_)
                    | ClientError::BucketNameEmpty
            )
        )
    }

    /// 删除目标时的权限错误是预期内的，直接忽略
    pub fn is_permission_denied(&self) -> bool {
        matches!(
            self,
            MirrorError::Client(ClientError::PathInsufficientPermission(_))
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, MirrorError::Client(ClientError::Cancelled))
    }
}

pub type Result<T, E = MirrorError> = std::result::Result<T, E>;
