use std::fmt::Display;
use std::future::Future;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Instant;

use thiserror::Error;

use crate::proof;
use crate::types::{
    CycleConfig, CycleReport, Exhausted, FoundProof, MinerConfig, MiningStats, Receipt, Step,
};
use crate::ui;

/// The three lifecycle calls of the farming contract: stake, proof
/// submission, reward claim. Implemented once per signing backend.
pub trait Farm {
    type Error: Display;

    fn plant(
        &self,
        farmer: &str,
        amount: i128,
    ) -> impl Future<Output = Result<Receipt<()>, Self::Error>>;

    fn work(
        &self,
        farmer: &str,
        hash: Vec<u8>,
        nonce: u64,
    ) -> impl Future<Output = Result<Receipt<u32>, Self::Error>>;

    fn harvest(
        &self,
        farmer: &str,
        index: u32,
    ) -> impl Future<Output = Result<Receipt<i128>, Self::Error>>;
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("{step} failed: {message}")]
    Step { step: Step, message: String },
    #[error("hash failed: {0}")]
    Exhausted(Exhausted),
}

impl CycleError {
    pub fn step(&self) -> Step {
        match self {
            CycleError::Step { step, .. } => *step,
            CycleError::Exhausted(_) => Step::Hash,
        }
    }

    fn at(step: Step, err: impl Display) -> Self {
        CycleError::Step {
            step,
            message: err.to_string(),
        }
    }
}

fn run_search(
    farmer: &[u8; 32],
    index: u32,
    difficulty: u32,
    max_attempts: u64,
    threads: usize,
) -> Result<FoundProof, Exhausted> {
    if threads > 1 {
        proof::search_parallel(farmer, index, difficulty, max_attempts)
    } else {
        proof::search(farmer, index, difficulty, max_attempts)
    }
}

/// One full plant -> work -> harvest cycle. Each step is confirmed before the
/// next begins; the settle delays on top give the chain state room to
/// propagate. A search that exhausts the cap is retried once at the fallback
/// difficulty before the cycle is declared failed.
pub async fn farm_cycle<F: Farm>(
    farm: &F,
    farmer: &str,
    cfg: &CycleConfig,
) -> Result<CycleReport, CycleError> {
    let plant = farm
        .plant(farmer, cfg.amount)
        .await
        .map_err(|e| CycleError::at(Step::Plant, e))?;
    ui::print_line(vec![
        format!("Plant({})", cfg.index),
        format!("tx: {}", plant.hash),
    ]);

    tokio::time::sleep(cfg.settle).await;

    let raw_farmer = proof::decode_farmer(farmer);
    let proof = match run_search(
        &raw_farmer,
        cfg.index,
        cfg.difficulty,
        cfg.max_attempts,
        cfg.threads,
    ) {
        Ok(p) => p,
        Err(first) => {
            ui::print_line(vec![
                format!("Retry({})", cfg.index),
                format!("z: {}", cfg.fallback_difficulty),
                format!("best: {}", first.best_zeros),
            ]);
            run_search(
                &raw_farmer,
                cfg.index,
                cfg.fallback_difficulty,
                cfg.max_attempts,
                cfg.threads,
            )
            .map_err(|second| {
                CycleError::Exhausted(Exhausted {
                    attempts: first.attempts + second.attempts,
                    best_zeros: first.best_zeros.max(second.best_zeros),
                })
            })?
        }
    };
    ui::print_line(vec![
        format!("Proof({})", proof.index),
        format!("z: {}", proof.zeros),
        format!("att: {}", proof.attempts),
        format!("{}", proof.nonce),
    ]);

    let work = farm
        .work(farmer, proof.digest.to_vec(), proof.nonce)
        .await
        .map_err(|e| CycleError::at(Step::Work, e))?;
    ui::print_line(vec![
        format!("Work({})", proof.index),
        format!("g: {}", work.value),
        format!("tx: {}", work.hash),
    ]);

    tokio::time::sleep(cfg.settle).await;

    match farm.harvest(farmer, proof.index).await {
        Ok(harvest) => {
            ui::print_line(vec![
                format!("Harvest({})", proof.index),
                format!("a: {:.2}", ui::normalize_amount(harvest.value)),
                format!("tx: {}", harvest.hash),
            ]);
            Ok(CycleReport {
                plant,
                proof,
                work,
                harvest: Some(harvest),
                harvest_error: None,
            })
        }
        // Harvest is the last step; its failure still leaves a worked pail
        // behind, so report what succeeded instead of discarding it.
        Err(e) => {
            ui::print_line(vec![
                format!("Harvest({})", proof.index),
                "X".to_string(),
                e.to_string(),
            ]);
            Ok(CycleReport {
                plant,
                proof,
                work,
                harvest: None,
                harvest_error: Some(e.to_string()),
            })
        }
    }
}

/// Continuous search -> work -> harvest loop over an already planted pail.
/// Gated by a run flag checked at the top of each iteration; collaborator
/// failures are logged and treated as transient.
pub struct Miner<F> {
    farm: F,
    farmer: String,
    raw_farmer: [u8; 32],
    cfg: MinerConfig,
    pub stats: MiningStats,
    running: Arc<AtomicBool>,
}

impl<F: Farm> Miner<F> {
    pub fn new(farm: F, farmer: String, cfg: MinerConfig) -> Self {
        let raw_farmer = proof::decode_farmer(&farmer);
        Miner {
            farm,
            farmer,
            raw_farmer,
            cfg,
            stats: MiningStats::default(),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Clearing the flag stops the loop once the current iteration and its
    /// wait complete. In-flight calls are never preempted.
    pub fn run_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub async fn run(&mut self) {
        self.stats.start = Some(Instant::now());

        while self.running.load(Ordering::SeqCst) {
            self.iterate().await;
            tokio::time::sleep(self.cfg.interval).await;
        }

        self.report();
    }

    async fn iterate(&mut self) {
        self.stats.attempts += 1;

        let proof = match run_search(
            &self.raw_farmer,
            self.cfg.index,
            self.cfg.difficulty,
            self.cfg.max_attempts,
            self.cfg.threads,
        ) {
            Ok(p) => p,
            Err(e) => {
                ui::print_line(vec![format!("Mining({})", self.cfg.index), e.to_string()]);
                return;
            }
        };

        match self
            .farm
            .work(&self.farmer, proof.digest.to_vec(), proof.nonce)
            .await
        {
            Ok(work) => {
                self.stats.successful_hashes += 1;
                ui::print_line(vec![
                    format!("Work({})", proof.index),
                    format!("n: {}", proof.nonce),
                    format!("g: {}", work.value),
                ]);

                match self.farm.harvest(&self.farmer, proof.index).await {
                    Ok(harvest) => {
                        self.stats.total_rewards += 1;
                        ui::print_line(vec![
                            format!("Harvest({})", proof.index),
                            format!("a: {:.2}", ui::normalize_amount(harvest.value)),
                        ]);
                    }
                    Err(e) => {
                        ui::print_line(vec![
                            format!("Harvest({})", proof.index),
                            "X".to_string(),
                            e.to_string(),
                        ]);
                    }
                }
            }
            Err(e) => {
                ui::print_line(vec![
                    format!("Work({})", proof.index),
                    "X".to_string(),
                    e.to_string(),
                ]);
            }
        }
    }

    fn report(&self) {
        ui::print_line(vec![
            "Stats".to_string(),
            format!("dur: {}s", self.stats.duration_secs()),
            format!("att: {}", self.stats.attempts),
            format!("ok: {}", self.stats.successful_hashes),
            format!("rate: {}%", self.stats.success_rate()),
            format!("rw: {}", self.stats.total_rewards),
        ]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    const FARMER: &str = "GAAACAQDAQCQMBYIBEFAWDANBYHRAEISCMKBKFQXDAMRUGY4DUPB7JZX";

    #[derive(Default)]
    struct MockFarm {
        fail_plant: bool,
        fail_work: bool,
        fail_harvest: bool,
        calls: Mutex<Vec<&'static str>>,
    }

    impl MockFarm {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Farm for MockFarm {
        type Error = String;

        async fn plant(&self, _farmer: &str, _amount: i128) -> Result<Receipt<()>, String> {
            self.calls.lock().unwrap().push("plant");
            if self.fail_plant {
                Err("pail exists".to_string())
            } else {
                Ok(Receipt {
                    hash: "tx-plant".to_string(),
                    value: (),
                })
            }
        }

        async fn work(
            &self,
            _farmer: &str,
            hash: Vec<u8>,
            _nonce: u64,
        ) -> Result<Receipt<u32>, String> {
            assert_eq!(hash.len(), 32);
            self.calls.lock().unwrap().push("work");
            if self.fail_work {
                Err("hash invalid".to_string())
            } else {
                Ok(Receipt {
                    hash: "tx-work".to_string(),
                    value: 3,
                })
            }
        }

        async fn harvest(&self, _farmer: &str, index: u32) -> Result<Receipt<i128>, String> {
            assert!(index > 0);
            self.calls.lock().unwrap().push("harvest");
            if self.fail_harvest {
                Err("harvest not ready".to_string())
            } else {
                Ok(Receipt {
                    hash: "tx-harvest".to_string(),
                    value: 10_000_000,
                })
            }
        }
    }

    fn quick_cfg() -> CycleConfig {
        CycleConfig {
            difficulty: 0,
            settle: Duration::ZERO,
            ..CycleConfig::default()
        }
    }

    #[tokio::test]
    async fn plant_failure_stops_the_cycle() {
        let farm = MockFarm {
            fail_plant: true,
            ..MockFarm::default()
        };

        let err = farm_cycle(&farm, FARMER, &quick_cfg()).await.unwrap_err();

        assert_eq!(err.step(), Step::Plant);
        assert_eq!(farm.calls(), vec!["plant"]);
    }

    #[tokio::test]
    async fn work_failure_stops_before_harvest() {
        let farm = MockFarm {
            fail_work: true,
            ..MockFarm::default()
        };

        let err = farm_cycle(&farm, FARMER, &quick_cfg()).await.unwrap_err();

        assert_eq!(err.step(), Step::Work);
        assert_eq!(farm.calls(), vec!["plant", "work"]);
    }

    #[tokio::test]
    async fn fallback_difficulty_keeps_the_cycle_alive() {
        let farm = MockFarm::default();
        // unreachable primary difficulty, trivially reachable fallback
        let cfg = CycleConfig {
            difficulty: 8,
            fallback_difficulty: 0,
            max_attempts: 5,
            settle: Duration::ZERO,
            ..CycleConfig::default()
        };

        let report = farm_cycle(&farm, FARMER, &cfg).await.unwrap();

        assert_eq!(farm.calls(), vec!["plant", "work", "harvest"]);
        assert!(report.harvest.is_some());
        assert_eq!(report.proof.zeros, proof::leading_zeros(&report.proof.hash_hex()));
    }

    #[tokio::test]
    async fn exhausting_both_difficulties_fails_at_hash() {
        let farm = MockFarm::default();
        let cfg = CycleConfig {
            difficulty: 8,
            fallback_difficulty: 8,
            max_attempts: 5,
            settle: Duration::ZERO,
            ..CycleConfig::default()
        };

        let err = farm_cycle(&farm, FARMER, &cfg).await.unwrap_err();

        assert_eq!(err.step(), Step::Hash);
        assert_eq!(farm.calls(), vec!["plant"]);
    }

    #[tokio::test]
    async fn harvest_failure_reports_partial_success() {
        let farm = MockFarm {
            fail_harvest: true,
            ..MockFarm::default()
        };

        let report = farm_cycle(&farm, FARMER, &quick_cfg()).await.unwrap();

        assert_eq!(report.plant.hash, "tx-plant");
        assert_eq!(report.work.hash, "tx-work");
        assert!(report.harvest.is_none());
        assert_eq!(report.harvest_error.as_deref(), Some("harvest not ready"));
        assert_eq!(report.failed_step(), Some(Step::Harvest));
    }

    #[tokio::test]
    async fn complete_cycle_reports_no_failed_step() {
        let farm = MockFarm::default();

        let report = farm_cycle(&farm, FARMER, &quick_cfg()).await.unwrap();

        assert!(report.harvest.is_some());
        assert_eq!(report.failed_step(), None);
    }

    #[tokio::test]
    async fn miner_stops_when_the_flag_clears() {
        let cfg = MinerConfig {
            difficulty: 0,
            interval: Duration::from_millis(5),
            ..MinerConfig::default()
        };
        let mut miner = Miner::new(MockFarm::default(), FARMER.to_string(), cfg);
        let flag = miner.run_flag();

        tokio::join!(miner.run(), async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            flag.store(false, Ordering::SeqCst);
        });

        assert!(miner.stats.attempts >= 1);
        assert_eq!(miner.stats.successful_hashes, miner.stats.attempts);
        assert_eq!(miner.stats.total_rewards, miner.stats.attempts);
    }

    #[tokio::test]
    async fn miner_treats_errors_as_transient() {
        let farm = MockFarm {
            fail_work: true,
            ..MockFarm::default()
        };
        let cfg = MinerConfig {
            difficulty: 0,
            interval: Duration::from_millis(1),
            ..MinerConfig::default()
        };
        let mut miner = Miner::new(farm, FARMER.to_string(), cfg);
        let flag = miner.run_flag();

        tokio::join!(miner.run(), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(false, Ordering::SeqCst);
        });

        // kept iterating past the work failures
        assert!(miner.stats.attempts > 1);
        assert_eq!(miner.stats.successful_hashes, 0);
    }
}
