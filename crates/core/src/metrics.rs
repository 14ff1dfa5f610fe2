//! 메트릭 상수 및 설명 등록
//!
//! 라이프사이클 실행의 모든 메트릭 이름과 설명을 중앙에서 정의합니다.
//! 각 모듈은 이 상수를 사용하여 `metrics::counter!()` 매크로를 호출합니다.
//!
//! # 네이밍 컨벤션
//!
//! - 접두어: `lifecheck_`
//! - 접미어: `_total` (counter)
//!
//! # 사용 예시
//!
//! ```ignore
//! use metrics::counter;
//!
//! counter!(lifecheck_core::metrics::RESOURCES_CREATED_TOTAL,
//!     lifecheck_core::metrics::LABEL_KIND => "vm").increment(1);
//! ```

// ─── 레이블 키 상수 ────────────────────────────────────────────────

/// 리소스 종류 레이블 키 (vm, disk, snapshot, stemcell)
pub const LABEL_KIND: &str = "kind";

/// 결과 레이블 키 (passed, failed)
pub const LABEL_RESULT: &str = "result";

// ─── 라이프사이클 메트릭 ───────────────────────────────────────────

/// 생성되어 존재가 확인된 리소스 수 (counter, label: kind)
pub const RESOURCES_CREATED_TOTAL: &str = "lifecheck_resources_created_total";

/// 해체 단계에서 해제된 리소스 수 (counter, label: kind)
pub const RESOURCES_RELEASED_TOTAL: &str = "lifecheck_resources_released_total";

/// 해체 단계에서 실패한 정리 액션 수 (counter, label: kind)
pub const TEARDOWN_FAILURES_TOTAL: &str = "lifecheck_teardown_failures_total";

/// 실행된 시나리오 수 (counter, label: result)
pub const SCENARIOS_TOTAL: &str = "lifecheck_scenarios_total";

// ─── 설명 등록 함수 ─────────────────────────────────────────────────

/// 모든 메트릭의 설명(description)을 등록합니다.
///
/// `ScenarioRunner::new`에서 호출됩니다. 레코더가 없으면 아무 동작도 하지 않습니다.
pub fn describe_all() {
    use metrics::describe_counter;

    describe_counter!(
        RESOURCES_CREATED_TOTAL,
        "Resources created by the provisioner and confirmed to exist"
    );
    describe_counter!(
        RESOURCES_RELEASED_TOTAL,
        "Resources released while unwinding a lifecycle run"
    );
    describe_counter!(
        TEARDOWN_FAILURES_TOTAL,
        "Cleanup actions that failed during unwind"
    );
    describe_counter!(SCENARIOS_TOTAL, "Scenario runs by result");
}
