//! 시나리오 실행기
//!
//! [`ScenarioRunner`]는 하나의 프로바이더에 대해 시나리오를 순서대로 실행합니다.
//!
//! # 스코프
//!
//! - 세션: 업로드한 스템셀. 모든 시나리오가 끝난 뒤 해체됩니다.
//! - 시나리오: floating IP를 쥔 VM, 미리 만든 디스크, light 스템셀.
//!   시나리오 실행이 끝나면 해체됩니다.
//! - 실행: [`VmLifecycle`]이 소유한 VM/디스크/스냅샷.
//!
//! 안쪽 스코프의 에러가 바깥 스코프의 해체 에러보다 우선합니다.

use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use lifecheck_core::config::IntegrationConfig;
use lifecheck_core::metrics as m;
use lifecheck_core::network::NetworkSpec;
use lifecheck_core::types::{StemcellCloudProperties, light_stemcell_id};

use crate::config::LifecycleConfig;
use crate::cpi::{CloudBackend, CloudProvider, CpiOptions};
use crate::error::LifecycleError;
use crate::lifecycle::{
    DiskSource, LifecycleProbe, LifecycleReport, LifecycleRequest, VmLifecycle,
    default_agent_env, prepare_existing_disk, vm_lifecycle,
};
use crate::provisioner::{ResourceProvisioner, VmRequest};
use crate::scenario::{
    DiskMode, Expectation, ExpectedOutcome, Fault, LightImage, MISSING_IMAGE_ID, Procedure,
    Scenario, ScenarioMatrix, Stage,
};
use crate::teardown::{TeardownAggregator, TeardownReport};
use crate::verifier::LifecycleVerifier;

/// light 스템셀 생성 시 넘기는 경로 (백엔드는 사용하지 않음)
const LIGHT_STEMCELL_PATH: &str = "not_relevant_path";

/// 연결된 적 없는 디스크 ID
const NON_EXISTING_DISK_ID: &str = "non-existing-disk";

/// 시나리오 하나의 결과
#[derive(Debug)]
pub struct ScenarioReport {
    pub name: String,
    pub expected: ExpectedOutcome,
    /// 우선순위 규칙이 적용된 최종 결과
    pub result: Result<(), LifecycleError>,
    /// 해체 이후 확인 실패
    pub check_failures: Vec<LifecycleError>,
    /// 실행 스코프와 시나리오 스코프의 해체 상세
    pub teardown: TeardownReport,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        self.expected.matches(&self.result) && self.check_failures.is_empty()
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.passed() { "PASS" } else { "FAIL" };
        write!(f, "{verdict} {} (expected {}", self.name, self.expected)?;
        match &self.result {
            Ok(()) => f.write_str(", got success)")?,
            Err(err) => write!(f, ", got [{}] {err})", err.class())?,
        }
        for failure in &self.check_failures {
            write!(f, "; {failure}")?;
        }
        Ok(())
    }
}

/// 전체 매트릭스 결과
#[derive(Debug)]
pub struct MatrixReport {
    pub scenarios: Vec<ScenarioReport>,
    /// 세션 스템셀 해체 상세
    pub session_teardown: TeardownReport,
}

impl MatrixReport {
    pub fn passed(&self) -> usize {
        self.scenarios.iter().filter(|s| s.passed()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ScenarioReport> {
        self.scenarios.iter().filter(|s| !s.passed())
    }

    pub fn get(&self, name: &str) -> Option<&ScenarioReport> {
        self.scenarios.iter().find(|s| s.name == name)
    }

    pub fn all_passed(&self) -> bool {
        self.failures().next().is_none() && self.session_teardown.is_clean()
    }
}

impl fmt::Display for MatrixReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} scenarios passed",
            self.passed(),
            self.scenarios.len()
        )?;
        if !self.session_teardown.is_clean() {
            write!(
                f,
                ", {} session teardown errors",
                self.session_teardown.errors.len()
            )?;
        }
        Ok(())
    }
}

/// 실행 중 시나리오 확인을 수행하는 probe
struct ScenarioProbe<'a, P: CloudProvider> {
    scenario: &'a Scenario,
    verifier: LifecycleVerifier<'a, P, P::Registry>,
    backend: &'a P::Cpi,
    options: &'a CpiOptions,
    security_group_baseline: u64,
    /// VM이 살아 있을 때 기록한 포트
    ports: Mutex<Vec<String>>,
}

impl<P: CloudProvider> LifecycleProbe for ScenarioProbe<'_, P> {
    async fn vm_ready(&self, vm_id: &str) -> Result<(), LifecycleError> {
        for expectation in self.scenario.expectations_at(Stage::VmReady) {
            match expectation {
                Expectation::MacAddressesMatchRegistry => {
                    self.verifier.expect_macs_match_registry(vm_id).await?;
                }
                Expectation::BootVolumeAt(device) => {
                    self.verifier.expect_boot_volume_at(vm_id, device).await?;
                }
                Expectation::VmNamedFromMetadata(name) => {
                    self.verifier.expect_vm_named(vm_id, name).await?;
                }
                Expectation::NoNetworkApiSecurityGroupLookups => {
                    self.verifier
                        .expect_no_security_group_lookups_since(self.security_group_baseline)
                        .await?;
                }
                Expectation::ConfigDriveAttached => {
                    self.verifier
                        .expect_config_drive(vm_id, self.options.config_drive)
                        .await?;
                }
                _ => {}
            }
        }

        if self.scenario.expectations.contains(&Expectation::PortsReleased) {
            let ports = self.verifier.ports_for(vm_id).await?;
            info!(vm_id, ports = ports.len(), "recorded vm ports");
            self.ports.lock().await.extend(ports);
        }
        Ok(())
    }

    async fn disk_attached(&self, vm_id: &str, disk_id: &str) -> Result<(), LifecycleError> {
        for expectation in self.scenario.expectations_at(Stage::DiskAttached) {
            if *expectation == Expectation::DiskMetadataWhitelist {
                self.verifier
                    .expect_disk_metadata_whitelist(vm_id, disk_id)
                    .await?;
            }
        }

        if self.scenario.fault == Some(Fault::DiskAlreadyDetached) {
            info!(vm_id, disk_id, "detaching disk out of band");
            self.backend.detach_disk(vm_id, disk_id).await?;
        }
        Ok(())
    }
}

fn aborted(err: LifecycleError) -> LifecycleReport<()> {
    LifecycleReport {
        result: Err(err),
        teardown: TeardownReport::default(),
    }
}

/// `AttachMetadataDisk`에서 VM에 덧붙이는 메타데이터
fn attach_disk_metadata() -> lifecheck_core::types::Metadata {
    [
        ("id", "my-id"),
        ("deployment", "my-deployment"),
        ("job", "my-job"),
        ("index", "my-index"),
        ("some_key", "some_value"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_owned(), v.to_owned()))
    .collect()
}

/// 시나리오 실행기
pub struct ScenarioRunner<P: CloudProvider> {
    provider: P,
    config: Arc<IntegrationConfig>,
    base: LifecycleConfig,
}

impl<P: CloudProvider> ScenarioRunner<P> {
    /// 세션 설정으로 실행기를 생성합니다.
    pub fn new(provider: P, config: Arc<IntegrationConfig>) -> Result<Self, LifecycleError> {
        let base = LifecycleConfig::from_core(&config)?;
        base.validate()?;
        m::describe_all();
        Ok(Self {
            provider,
            config,
            base,
        })
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn base_config(&self) -> &LifecycleConfig {
        &self.base
    }

    /// 스템셀을 업로드하고 모든 시나리오를 순서대로 실행합니다.
    ///
    /// # Errors
    ///
    /// 세션 스템셀 업로드가 실패하면 시나리오를 실행하지 않고 에러를 돌려줍니다.
    pub async fn run(&self, matrix: &ScenarioMatrix) -> Result<MatrixReport, LifecycleError> {
        let provisioner = ResourceProvisioner::new(Arc::new(self.provider.cpi(&self.base.cpi)));
        let mut session = TeardownAggregator::new();

        let stemcell = match provisioner
            .create_stemcell(
                &mut session,
                &self.config.cloud.stemcell_path,
                &StemcellCloudProperties::default(),
            )
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                let report = session.unwind(&provisioner).await;
                return TeardownAggregator::finish(Err(err), &report);
            }
        };
        info!(stemcell_id = %stemcell.id, scenarios = matrix.len(), "session stemcell uploaded");

        let mut scenarios = Vec::with_capacity(matrix.len());
        for scenario in matrix {
            scenarios.push(self.run_scenario(scenario, &stemcell.id).await);
        }

        let session_teardown = session.unwind(&provisioner).await;
        let report = MatrixReport {
            scenarios,
            session_teardown,
        };
        info!(summary = %report, "scenario matrix finished");
        Ok(report)
    }

    /// 시나리오 하나를 실행합니다.
    pub async fn run_scenario(&self, scenario: &Scenario, stemcell_id: &str) -> ScenarioReport {
        info!(
            scenario = %scenario.name,
            procedure = ?scenario.procedure,
            topology = ?scenario.topology,
            "running scenario"
        );

        let config = scenario.lifecycle_config(&self.base);
        let provisioner = ResourceProvisioner::new(Arc::new(self.provider.cpi(&config.cpi)));
        let verifier = LifecycleVerifier::new(&self.provider, self.provider.registry());

        let (result, teardown, check_failures) = match verifier.security_group_lookups().await {
            Ok(baseline) => {
                let probe = ScenarioProbe::<P> {
                    scenario,
                    verifier: LifecycleVerifier::new(&self.provider, self.provider.registry()),
                    backend: provisioner.backend(),
                    options: &config.cpi,
                    security_group_baseline: baseline,
                    ports: Mutex::default(),
                };

                let mut scope = TeardownAggregator::new();
                let inner = self
                    .execute(scenario, &provisioner, &config, &mut scope, stemcell_id, &probe)
                    .await;
                let scope_report = scope.unwind(&provisioner).await;
                let result = TeardownAggregator::finish(inner.result, &scope_report);
                let mut teardown = inner.teardown;
                teardown.merge(scope_report);

                let check_failures = self.after_teardown(scenario, &probe).await;
                (result, teardown, check_failures)
            }
            Err(err) => (Err(err), TeardownReport::default(), Vec::new()),
        };

        let report = ScenarioReport {
            name: scenario.name.clone(),
            expected: scenario.expected.clone(),
            result,
            check_failures,
            teardown,
        };

        if let Err(err) = &report.result {
            debug!(
                scenario = %scenario.name,
                phase = %err.phase(),
                class = %err.class(),
                error = %err,
                "scenario ended with an error"
            );
        }
        let outcome = if report.passed() { "passed" } else { "failed" };
        metrics::counter!(m::SCENARIOS_TOTAL, m::LABEL_RESULT => outcome).increment(1);
        if report.passed() {
            info!(scenario = %scenario.name, "scenario passed");
        } else {
            warn!(scenario = %scenario.name, report = %report, "scenario failed");
        }
        report
    }

    async fn execute(
        &self,
        scenario: &Scenario,
        provisioner: &ResourceProvisioner<P::Cpi>,
        config: &LifecycleConfig,
        scope: &mut TeardownAggregator,
        stemcell_id: &str,
        probe: &ScenarioProbe<'_, P>,
    ) -> LifecycleReport<()> {
        let networks = match scenario.networks(&self.config.network) {
            Ok(networks) => networks,
            Err(err) => return aborted(err.into()),
        };

        match scenario.procedure {
            Procedure::Lifecycle => {
                self.lifecycle(scenario, provisioner, config, scope, stemcell_id, &networks, probe)
                    .await
            }
            Procedure::LightStemcellLifecycle => {
                let light = match provisioner
                    .create_stemcell(
                        scope,
                        LIGHT_STEMCELL_PATH,
                        &StemcellCloudProperties::light(stemcell_id),
                    )
                    .await
                {
                    Ok(handle) => handle,
                    Err(err) => return aborted(err),
                };
                self.lifecycle(scenario, provisioner, config, scope, &light.id, &networks, probe)
                    .await
            }
            Procedure::CreateVm => {
                let pool = scenario.resource_pool(config);
                let mut run = VmLifecycle::new(provisioner, config);
                let outcome = async {
                    let vm = run.create_vm(stemcell_id, &networks, &pool, &[]).await?;
                    probe.vm_ready(&vm.id).await
                }
                .await;
                run.tear_down(outcome).await
            }
            Procedure::AttachMetadataDisk => {
                let pool = scenario.resource_pool(config);
                let mut run = VmLifecycle::new(provisioner, config);
                let outcome = async {
                    let vm = run.create_vm(stemcell_id, &networks, &pool, &[]).await?;
                    probe.vm_ready(&vm.id).await?;
                    run.set_vm_metadata(&vm.id, &attach_disk_metadata()).await?;
                    let disk = run
                        .create_disk(&vm.id, &scenario.disk_cloud_properties())
                        .await?;
                    run.attach_disk(&vm.id, &disk.id).await?;
                    probe.disk_attached(&vm.id, &disk.id).await
                }
                .await;
                run.tear_down(outcome).await
            }
            Procedure::DetachUnattachedDisk => {
                let pool = scenario.resource_pool(config);
                let mut run = VmLifecycle::new(provisioner, config);
                let outcome = async {
                    let vm = run.create_vm(stemcell_id, &networks, &pool, &[]).await?;
                    probe.vm_ready(&vm.id).await?;
                    provisioner.detach_disk(&vm.id, NON_EXISTING_DISK_ID).await
                }
                .await;
                run.tear_down(outcome).await
            }
            Procedure::LightStemcell(image) => {
                let image_id = match image {
                    LightImage::Existing => stemcell_id,
                    LightImage::Missing => MISSING_IMAGE_ID,
                };
                let result = async {
                    let handle = provisioner
                        .create_stemcell(
                            scope,
                            LIGHT_STEMCELL_PATH,
                            &StemcellCloudProperties::light(image_id),
                        )
                        .await?;
                    let expected = light_stemcell_id(image_id);
                    if handle.id == expected {
                        Ok(())
                    } else {
                        Err(LifecycleError::verification(
                            "light_stemcell",
                            format!("got stemcell '{}', expected '{expected}'", handle.id),
                        ))
                    }
                }
                .await;
                LifecycleReport {
                    result,
                    teardown: TeardownReport::default(),
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn lifecycle(
        &self,
        scenario: &Scenario,
        provisioner: &ResourceProvisioner<P::Cpi>,
        config: &LifecycleConfig,
        scope: &mut TeardownAggregator,
        stemcell_id: &str,
        networks: &NetworkSpec,
        probe: &ScenarioProbe<'_, P>,
    ) -> LifecycleReport<()> {
        let disk = match self
            .prepare(scenario, provisioner, config, scope, stemcell_id, networks)
            .await
        {
            Ok(disk) => disk,
            Err(err) => return aborted(err),
        };

        let request = LifecycleRequest {
            stemcell_id,
            networks,
            resource_pool: scenario.resource_pool(config),
            disk,
        };
        let report = vm_lifecycle(provisioner, config, &request, probe).await;
        LifecycleReport {
            result: report.result.map(|handles| {
                info!(
                    vm_id = %handles.vm.id,
                    disk_id = %handles.disk.id,
                    disk_snapshot_id = ?handles.snapshot.as_ref().map(|s| s.id.as_str()),
                    "lifecycle completed"
                );
            }),
            teardown: report.teardown,
        }
    }

    /// 시나리오 스코프 준비: floating IP 보유 VM, 미리 만든 디스크
    async fn prepare(
        &self,
        scenario: &Scenario,
        provisioner: &ResourceProvisioner<P::Cpi>,
        config: &LifecycleConfig,
        scope: &mut TeardownAggregator,
        stemcell_id: &str,
        networks: &NetworkSpec,
    ) -> Result<DiskSource, LifecycleError> {
        if scenario.floating_ip_holder {
            let env = default_agent_env();
            let pool = config.resource_pool();
            let holder = provisioner
                .create_vm(
                    scope,
                    VmRequest {
                        agent_id: &config.agent_id,
                        stemcell_id,
                        resource_pool: &pool,
                        networks,
                        disk_locality: &[],
                        env: &env,
                    },
                )
                .await?;
            info!(vm_id = %holder.id, "vm holding floating ip created");
        }

        match scenario.disk_mode {
            DiskMode::Fresh => Ok(DiskSource::Fresh(scenario.disk_cloud_properties())),
            DiskMode::PreExisting => {
                let disk =
                    prepare_existing_disk(provisioner, config, scope, stemcell_id, networks)
                        .await?;
                Ok(DiskSource::Existing(disk.id))
            }
        }
    }

    async fn after_teardown(
        &self,
        scenario: &Scenario,
        probe: &ScenarioProbe<'_, P>,
    ) -> Vec<LifecycleError> {
        let mut failures = Vec::new();
        for expectation in scenario.expectations_at(Stage::AfterTeardown) {
            let checked = match expectation {
                Expectation::NoResidualResources => {
                    probe.verifier.expect_no_residual_resources().await
                }
                Expectation::PortsReleased => {
                    let ports = probe.ports.lock().await.clone();
                    if ports.is_empty() {
                        Err(LifecycleError::verification(
                            "ports_released",
                            "no ports were recorded while the vm was running",
                        ))
                    } else {
                        probe.verifier.expect_ports_released(&ports).await
                    }
                }
                Expectation::NoActiveVmWithIp(ip) => {
                    probe.verifier.expect_no_active_vm_with_ip(*ip).await
                }
                _ => Ok(()),
            };
            if let Err(err) = checked {
                warn!(scenario = %scenario.name, error = %err, "post-teardown check failed");
                failures.push(err);
            }
        }
        failures
    }
}
