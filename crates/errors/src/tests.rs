#[cfg(test)]
mod error_tests {
    use crate::*;

    #[test]
    fn test_orchestrator_error_display() {
        let stale = OrchestratorError::StaleData { id: 42 };
        assert_eq!(stale.to_string(), "媒体条目数据已过期: 42");

        let cancelled = OrchestratorError::Cancelled;
        assert_eq!(cancelled.to_string(), "任务已取消");

        let service = OrchestratorError::service("scraper", "connection reset");
        assert_eq!(service.to_string(), "服务 scraper 执行失败: connection reset");

        let transition = OrchestratorError::InvalidTransition {
            job_id: "job-1".to_string(),
            from: "COMPLETED".to_string(),
            to: "RUNNING".to_string(),
        };
        assert_eq!(
            transition.to_string(),
            "无效的任务状态转换: 任务 job-1 从 COMPLETED 到 RUNNING"
        );
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(
            OrchestratorError::StaleData { id: 1 }.class(),
            ErrorClass::Benign
        );
        assert_eq!(OrchestratorError::Cancelled.class(), ErrorClass::Benign);
        assert_eq!(
            OrchestratorError::item_not_found(7).class(),
            ErrorClass::Benign
        );

        assert!(OrchestratorError::service("debrid", "503").is_retryable());
        assert!(OrchestratorError::ExecutionTimeout.is_retryable());
        assert!(OrchestratorError::Network("refused".to_string()).is_retryable());

        let invalid = OrchestratorError::invalid_result("indexer", "unrelated item 9");
        assert_eq!(invalid.class(), ErrorClass::Fatal);
        assert!(!invalid.is_retryable());
        assert!(!invalid.is_benign());
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let converted: OrchestratorError = err.into();
        assert!(matches!(converted, OrchestratorError::Serialization(_)));
        assert_eq!(converted.class(), ErrorClass::Fatal);
    }
}
