use crate::error::MirrorError;
use crate::storage::ClientContent;

/// 任务类型，由源/目标条目是否存在决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// 复制源到目标
    Copy,
    /// 删除目标
    Remove,
    /// 只携带错误
    Error,
}

/// 一个镜像任务：源条目、目标条目和累计统计
#[derive(Debug, Clone, Default)]
pub struct Urls {
    pub source_alias: String,
    pub source_content: Option<ClientContent>,
    pub target_alias: String,
    pub target_content: Option<ClientContent>,
    /// 入队时的累计对象数
    pub total_count: u64,
    /// 入队时的累计字节数
    pub total_size: u64,
    pub error: Option<MirrorError>,
}

impl Urls {
    pub fn copy(
        source_alias: &str,
        source: ClientContent,
        target_alias: &str,
        target: ClientContent,
    ) -> Self {
        Self {
            source_alias: source_alias.to_string(),
            source_content: Some(source),
            target_alias: target_alias.to_string(),
            target_content: Some(target),
            ..Default::default()
        }
    }

    pub fn remove(target_alias: &str, target: ClientContent) -> Self {
        Self {
            target_alias: target_alias.to_string(),
            target_content: Some(target),
            ..Default::default()
        }
    }

    pub fn from_error(err: MirrorError) -> Self {
        Self {
            error: Some(err),
            ..Default::default()
        }
    }

    /// 替换错误，返回自身便于链式调用
    pub fn with_error(mut self, err: Option<MirrorError>) -> Self {
        self.error = err;
        self
    }

    pub fn kind(&self) -> TaskKind {
        match (&self.source_content, &self.target_content) {
            (Some(_), _) => TaskKind::Copy,
            (None, Some(_)) => TaskKind::Remove,
            (None, None) => TaskKind::Error,
        }
    }

    /// 源对象大小，删除任务为 0
    pub fn size(&self) -> u64 {
        self.source_content.as_ref().map_or(0, |c| c.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;

    #[test]
    fn test_task_kind() {
        let copy = Urls::copy("src", ClientContent::new("a"), "dst", ClientContent::new("a"));
        assert_eq!(copy.kind(), TaskKind::Copy);

        let remove = Urls::remove("dst", ClientContent::new("b"));
        assert_eq!(remove.kind(), TaskKind::Remove);
        assert_eq!(remove.size(), 0);

        let err = Urls::from_error(MirrorError::InvalidTarget("x".into()));
        assert_eq!(err.kind(), TaskKind::Error);
        assert_eq!(Urls::default().kind(), TaskKind::Error);
    }

    #[test]
    fn test_with_error_replaces() {
        let urls = Urls::remove("dst", ClientContent::new("b"))
            .with_error(Some(ClientError::Cancelled.into()));
        assert!(urls.error.as_ref().unwrap().is_cancelled());
        let urls = urls.with_error(None);
        assert!(urls.error.is_none());
        assert_eq!(urls.kind(), TaskKind::Remove);
    }
}
