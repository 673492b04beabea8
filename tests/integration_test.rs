use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use mfnprobe::diagnostic::DiagnosticRecord;
use mfnprobe::exchange::{ExchangePolicy, ExchangeVerdict};
use mfnprobe::memory::{Mfn, Pfn};
use mfnprobe::util::{AbortFlag, abort_after};
use mfnprobe::{Search, SearchConfig, SearchReport, SearchState};
use mfnprobe_sim::{Owner, SimConfig, SimGuest};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn search(guest: &SimGuest, config: SearchConfig) -> anyhow::Result<SearchReport> {
    Ok(Search::builder()
        .allocator(guest.clone())
        .translator(guest.clone())
        .exchanger(guest.clone())
        .config(config)
        .build()?
        .run())
}

#[test]
fn test_defect_candidate_exchange_is_rejected() -> anyhow::Result<()> {
    init_logging();
    // machine frame 503 belongs to another tenant
    let guest = SimGuest::from_layout(100, &[500, 501, 502, 999], &[503], 1024, 1)?;
    let report = search(&guest, SearchConfig::default())?;

    assert_eq!(report.state, SearchState::Found);
    let found = report.found.expect("candidate");
    assert_eq!(found.phys, Pfn::new(100).phys_addr());
    assert_eq!(found.machine, Mfn::new(500).machine_addr());
    assert!(found.prefix.contiguous);
    assert!(!found.full.contiguous);
    assert_eq!(found.outcome.verdict, ExchangeVerdict::NotRelocated);
    assert!(found.outcome.is_anomaly());
    assert!(found.outcome.exceeds_verified());

    let stats = guest.stats();
    assert_eq!(stats.exchanges, 1);
    assert_eq!(stats.rejected_exchanges, 1);
    assert_eq!(stats.allocations, stats.releases);
    assert_eq!(guest.owner(Mfn::new(503)), Some(Owner::Foreign));
    Ok(())
}

#[test]
fn test_contiguous_block_is_relocated() -> anyhow::Result<()> {
    init_logging();
    let guest = SimGuest::from_layout(100, &[500, 501, 502, 503], &[], 1024, 1)?;
    let records = Rc::new(RefCell::new(Vec::<DiagnosticRecord>::new()));
    let report = Search::builder()
        .allocator(guest.clone())
        .translator(guest.clone())
        .exchanger(guest.clone())
        .sink(records.clone())
        .config(SearchConfig {
            max_attempts: 1,
            ..Default::default()
        })
        .build()?
        .run();

    assert_eq!(report.state, SearchState::Exhausted);
    assert!(report.found.is_none());
    assert_eq!(report.stats.contiguous_exchanges, 1);
    assert_eq!(report.stats.contiguous_anomalies, 0);
    let relocated = records.borrow().iter().any(|r| {
        matches!(
            r,
            DiagnosticRecord::Exchange { candidate: false, outcome, .. }
                if outcome.verdict == ExchangeVerdict::Relocated
        )
    });
    assert!(relocated);
    assert_eq!(guest.stats().rejected_exchanges, 0);
    assert_eq!(guest.stats().corrupted_frames, 0);
    Ok(())
}

#[test]
fn test_guarded_policy_withholds_exchange() -> anyhow::Result<()> {
    init_logging();
    let guest = SimGuest::from_layout(100, &[500, 501, 502, 999], &[503], 1024, 1)?;
    let report = search(
        &guest,
        SearchConfig {
            policy: ExchangePolicy::Guarded,
            ..Default::default()
        },
    )?;
    assert_eq!(report.state, SearchState::Found);
    let outcome = report.found.expect("candidate").outcome;
    assert_eq!(outcome.verdict, ExchangeVerdict::Withheld);
    assert_eq!(outcome.observed, None);
    assert_eq!(guest.stats().exchanges, 0);
    Ok(())
}

#[test]
fn test_exchange_corrupts_other_guest_page() -> anyhow::Result<()> {
    init_logging();
    // machine frame 503 backs guest frame 104, which is outside the candidate block
    let guest = SimGuest::from_layout(
        100,
        &[500, 501, 502, 999, 503, 600, 601, 602],
        &[],
        1024,
        3,
    )?;
    let report = search(&guest, SearchConfig::default())?;

    assert_eq!(report.state, SearchState::Found);
    let found = report.found.expect("candidate");
    assert_eq!(found.phys, Pfn::new(100).phys_addr());
    assert_eq!(found.outcome.verdict, ExchangeVerdict::Relocated);
    let stats = guest.stats();
    assert_eq!(stats.corrupted_frames, 1);
    assert_eq!(stats.leaked_frames, 1);
    assert_eq!(stats.allocations, stats.releases);
    // every non-candidate sample was the fragmented block at 104
    assert_eq!(report.stats.non_matching, report.stats.attempts - 1);
    Ok(())
}

#[test]
fn test_random_guest_balances_allocations() -> anyhow::Result<()> {
    init_logging();
    for seed in 0..8 {
        let guest = SimGuest::new(SimConfig {
            guest_frames: 512,
            machine_frames: 4096,
            allocation_failure_rate: 0.05,
            seed,
            ..Default::default()
        })?;
        let report = search(
            &guest,
            SearchConfig {
                max_attempts: 500,
                ..Default::default()
            },
        )?;
        assert!(report.state.is_terminal());
        let stats = guest.stats();
        assert_eq!(stats.allocations, stats.releases);
        assert_eq!(stats.live_blocks, 0);
        assert_eq!(
            report.stats.attempts,
            stats.allocations + report.stats.allocation_failures
        );
        if report.state == SearchState::Found {
            let found = report.found.expect("candidate");
            assert!(found.prefix.contiguous && !found.full.contiguous);
        }
    }
    Ok(())
}

#[test]
fn test_timeout_aborts_search() -> anyhow::Result<()> {
    init_logging();
    // the first exchange scatters the block, after that every sample is fragmented
    let guest = SimGuest::from_layout(100, &[500, 501, 502, 503], &[], 1024, 1)?;
    let abort = AbortFlag::new();
    let watchdog = abort_after(&abort, Duration::from_millis(50));
    let report = Search::builder()
        .allocator(guest.clone())
        .translator(guest.clone())
        .exchanger(guest.clone())
        .abort_flag(abort)
        .config(SearchConfig {
            max_attempts: u64::MAX,
            ..Default::default()
        })
        .build()?
        .run();
    watchdog.join().expect("watchdog");
    assert_eq!(report.state, SearchState::Aborted);
    assert!(report.stats.attempts > 0);
    assert_eq!(guest.stats().allocations, guest.stats().releases);
    Ok(())
}
