//! Implementations of the scheduler's admin command surface.
//!
//! This is a CLI, not an HTTP API — nothing in this system's scope calls
//! for a network-reachable admin surface.

use shared::filters::FilterDoc;
use shared::proxy_manager::ProxyManager;
use shared::store::{found_items, proxies, tasks, Store};

pub fn create_task(
    store: &Store,
    owner_id: &str,
    name: &str,
    url: &str,
    filters_json: &str,
    check_interval_seconds: i64,
) -> shared::Result<()> {
    let conn = store.open_session()?;
    let filters = FilterDoc::from_json(filters_json)?;
    let id = tasks::create_task(&conn, owner_id, name, url, &filters, check_interval_seconds)?;
    println!("created task {id}");
    Ok(())
}

pub fn list_tasks(store: &Store, owner_id: Option<&str>) -> shared::Result<()> {
    let conn = store.open_session()?;
    let all = tasks::list_tasks(&conn, owner_id)?;
    if all.is_empty() {
        println!("no tasks");
        return Ok(());
    }
    println!("{:<5} {:<12} {:<24} {:<8} {:<12} {}", "id", "owner", "name", "active", "checks", "next_check");
    for task in all {
        println!(
            "{:<5} {:<12} {:<24} {:<8} {:<12} {}",
            task.id, task.owner_id, task.name, task.is_active, task.total_checks, task.next_check
        );
    }
    Ok(())
}

pub fn show_task(store: &Store, task_id: i64) -> shared::Result<()> {
    let conn = store.open_session()?;
    match tasks::get_task(&conn, task_id)? {
        Some(task) => {
            let found = found_items::count_for_task(&conn, task_id)?;
            println!("{task:#?}");
            println!("found_items: {found}");
        }
        None => println!("no task with id {task_id}"),
    }
    Ok(())
}

pub fn activate_task(store: &Store, task_id: i64) -> shared::Result<()> {
    let conn = store.open_session()?;
    tasks::set_active(&conn, task_id, true)?;
    println!("activated task {task_id}");
    Ok(())
}

pub fn deactivate_task(store: &Store, task_id: i64) -> shared::Result<()> {
    let conn = store.open_session()?;
    tasks::set_active(&conn, task_id, false)?;
    println!("deactivated task {task_id}");
    Ok(())
}

pub fn delete_task(store: &Store, task_id: i64) -> shared::Result<()> {
    let conn = store.open_session()?;
    tasks::delete_task(&conn, task_id)?;
    println!("deleted task {task_id}");
    Ok(())
}

pub fn register_proxy(manager: &ProxyManager, endpoint: &str) -> shared::Result<()> {
    let id = manager.register(endpoint)?;
    println!("registered proxy {id} ({endpoint})");
    Ok(())
}

pub fn list_proxies(manager: &ProxyManager) -> shared::Result<()> {
    let all = manager.list()?;
    if all.is_empty() {
        println!("no proxies");
        return Ok(());
    }
    println!("{:<5} {:<28} {:<8} {:<10} {:<10} {}", "id", "endpoint", "active", "successes", "failures", "blocked_until");
    for proxy in all {
        println!(
            "{:<5} {:<28} {:<8} {:<10} {:<10} {}",
            proxy.id,
            proxy.endpoint,
            proxy.is_active,
            proxy.successes,
            proxy.failures,
            proxy.blocked_until.map(|b| b.to_string()).unwrap_or_else(|| "-".to_string())
        );
    }
    Ok(())
}

pub fn unblock_proxy(manager: &ProxyManager, proxy_id: i64) -> shared::Result<()> {
    manager.unblock(proxy_id)?;
    println!("unblocked proxy {proxy_id}");
    Ok(())
}

pub fn deactivate_proxy(manager: &ProxyManager, proxy_id: i64) -> shared::Result<()> {
    manager.deactivate(proxy_id)?;
    println!("deactivated proxy {proxy_id}");
    Ok(())
}

pub fn status(store: &Store) -> shared::Result<()> {
    let conn = store.open_session()?;
    let all_tasks = tasks::list_tasks(&conn, None)?;
    let active = all_tasks.iter().filter(|t| t.is_active).count();
    let total_checks: i64 = all_tasks.iter().map(|t| t.total_checks).sum();
    let now = shared::time::now_unix();
    let leasable = proxies::leasable_candidates(&conn, now, i64::MAX)?.len();
    let proxy_stats = proxies::stats(&conn, now)?;

    println!("tasks: {} total, {active} active, {total_checks} checks performed", all_tasks.len());
    println!(
        "proxies: {} total, {} active, {} inactive, {} blocked ({} active_blocked), {leasable} currently leasable",
        proxy_stats.total, proxy_stats.active, proxy_stats.inactive, proxy_stats.blocked, proxy_stats.active_blocked
    );
    Ok(())
}

/// Prunes found-item de-duplication records older than `older_than_days`.
/// Disabled by default in the CLI surface — an operator must opt in on each
/// invocation, since pruning allows a previously-notified listing to be
/// re-notified.
pub fn prune_found_items(store: &Store, older_than_days: i64) -> shared::Result<()> {
    let conn = store.open_session()?;
    let pruned = found_items::prune_older_than(&conn, older_than_days)?;
    println!("pruned {pruned} found_items older than {older_than_days} days");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("test.db"), Duration::from_secs(5));
        store.migrate().unwrap();
        (dir, store)
    }

    #[test]
    fn create_list_and_delete_task_round_trip() {
        let (_dir, store) = test_store();
        create_task(&store, "owner-1", "AK redlines", "https://example/market", "{}", 60).unwrap();

        let conn = store.open_session().unwrap();
        let tasks_list = tasks::list_tasks(&conn, None).unwrap();
        assert_eq!(tasks_list.len(), 1);
        let task_id = tasks_list[0].id;
        drop(conn);

        deactivate_task(&store, task_id).unwrap();
        let conn = store.open_session().unwrap();
        assert!(!tasks::get_task(&conn, task_id).unwrap().unwrap().is_active);
        drop(conn);

        activate_task(&store, task_id).unwrap();
        let conn = store.open_session().unwrap();
        assert!(tasks::get_task(&conn, task_id).unwrap().unwrap().is_active);
        drop(conn);

        delete_task(&store, task_id).unwrap();
        let conn = store.open_session().unwrap();
        assert!(tasks::get_task(&conn, task_id).unwrap().is_none());
    }

    #[test]
    fn create_task_rejects_invalid_filters_json() {
        let (_dir, store) = test_store();
        let result = create_task(&store, "owner-1", "t", "u", "not json", 60);
        assert!(result.is_err());
    }

    #[test]
    fn register_and_list_proxy_round_trip() {
        let (_dir, store) = test_store();
        let manager = ProxyManager::new(store, Duration::from_secs(300));
        register_proxy(&manager, "http://proxy-a:8080").unwrap();

        let all = manager.list().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].endpoint, "http://proxy-a:8080");
    }
}
