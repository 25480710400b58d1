mod common;

use common::{Project, Task, TestDb};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tabula_core::{
    Context, ErrorCode, FieldFilter, SearchCondition, SearchParams, StorageError, StorageResult,
};

#[test]
fn successful_closure_commits() {
    let db = TestDb::new();

    let id = db
        .storage
        .atomic(|tx| {
            let mut project = Project::new("committed", "alice", 1);
            tx.crud::<Project>(&Context::background())?
                .create_one(&mut project)?;
            Ok(project.id)
        })
        .unwrap();

    assert_eq!(db.project_count(), 1);
    let loaded = db
        .storage
        .crud::<Project>(&Context::background())
        .unwrap()
        .find_by_id(id)
        .unwrap();
    assert_eq!(loaded.name, "committed");
}

#[test]
fn failing_closure_rolls_back_and_returns_its_error() {
    let db = TestDb::new();

    let err = db
        .storage
        .atomic(|tx| {
            tx.crud::<Project>(&Context::background())?
                .create_one(&mut Project::new("discarded", "alice", 1))?;
            Err::<(), _>(StorageError::invalid_argument("budget exhausted"))
        })
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    assert_eq!(err.message(), "budget exhausted");
    assert_eq!(db.project_count(), 0);
}

#[test]
fn panicking_closure_rolls_back_and_repanics() {
    let db = TestDb::new();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        db.storage.atomic(|tx| -> StorageResult<()> {
            tx.crud::<Project>(&Context::background())?
                .create_one(&mut Project::new("doomed", "alice", 1))?;
            panic!("boom")
        })
    }));

    let payload = outcome.unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
    assert_eq!(db.project_count(), 0);
}

#[test]
fn nested_failure_only_discards_inner_work() {
    let db = TestDb::new();

    db.storage
        .atomic(|outer| {
            outer
                .crud::<Project>(&Context::background())?
                .create_one(&mut Project::new("outer", "alice", 1))?;

            let inner = outer.atomic(|inner| {
                inner
                    .crud::<Project>(&Context::background())?
                    .create_one(&mut Project::new("inner", "alice", 2))?;
                Err::<(), _>(StorageError::internal("inner gave up"))
            });
            assert_eq!(inner.unwrap_err().code(), ErrorCode::Internal);
            Ok(())
        })
        .unwrap();

    let names = db
        .storage
        .crud::<Project>(&Context::background())
        .unwrap()
        .list_all()
        .unwrap()
        .into_iter()
        .map(|project| project.name)
        .collect::<Vec<_>>();
    assert_eq!(names, ["outer"]);
}

#[test]
fn delete_hooks_see_every_deleted_entity() {
    let db = TestDb::new();
    let projects = db.seed_projects(3);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    db.storage.register_delete_hook(move |_, record| {
        let project = record.downcast_ref::<Project>().map(|p| p.name.clone());
        sink.lock()
            .unwrap()
            .push((record.table.to_string(), record.id, project));
        Ok(())
    });

    let store = db.storage.crud::<Project>(&Context::background()).unwrap();
    store.delete_by_id(projects[0].id).unwrap();
    store
        .delete_by_ids(&[projects[1].id, projects[2].id])
        .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert_eq!(
        seen[0],
        (
            "projects".to_string(),
            projects[0].id,
            Some("project-00".to_string())
        )
    );
    assert!(seen.iter().all(|(table, _, _)| table == "projects"));
}

#[test]
fn failing_delete_hook_aborts_the_delete() {
    let db = TestDb::new();
    let projects = db.seed_projects(2);
    db.storage.register_delete_hook(|_, record| {
        match record.downcast_ref::<Project>() {
            Some(project) if project.name == "project-01" => {
                Err(StorageError::invalid_argument("project-01 is protected"))
            }
            _ => Ok(()),
        }
    });

    let store = db.storage.crud::<Project>(&Context::background()).unwrap();
    let err = store
        .delete_by_ids(&[projects[0].id, projects[1].id])
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    assert_eq!(db.project_count(), 2);
}

#[test]
fn delete_hook_writes_join_the_caller_transaction() {
    let db = TestDb::new();

    let mut project = Project::new("parent", "alice", 1);
    project.tasks = vec![Task::new("child-a"), Task::new("child-b")];
    db.storage
        .crud::<Project>(&Context::background())
        .unwrap()
        .update_one(&mut project, true)
        .unwrap();

    db.storage.register_delete_hook(|storage, record| {
        if record.table != "projects" {
            return Ok(());
        }
        let tasks = storage.crud::<Task>(&Context::background())?;
        let owned = tasks.search(&SearchParams::internal(vec![FieldFilter::new(
            "projectId",
            SearchCondition::Eq,
            record.id.to_string(),
        )]))?;
        let ids = owned.items.iter().map(|task| task.id).collect::<Vec<_>>();
        tasks.delete_by_ids(&ids)
    });

    let err = db
        .storage
        .atomic(|tx| {
            tx.crud::<Project>(&Context::background())?
                .delete_by_id(project.id)?;
            Err::<(), _>(StorageError::internal("changed my mind"))
        })
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Internal);

    let tasks = db.storage.crud::<Task>(&Context::background()).unwrap();
    assert_eq!(tasks.count().unwrap(), 2);
    assert_eq!(db.project_count(), 1);

    db.storage
        .crud::<Project>(&Context::background())
        .unwrap()
        .delete_by_id(project.id)
        .unwrap();
    assert_eq!(tasks.count().unwrap(), 0);
}

#[test]
fn aborted_delete_discards_earlier_hook_writes() {
    let db = TestDb::new();
    let projects = db.seed_projects(3);
    let witness = projects[2].id;

    db.storage.register_delete_hook(move |storage, record| {
        match record.downcast_ref::<Project>().map(|project| project.name.as_str()) {
            Some("project-00") => {
                let store = storage.crud::<Project>(&Context::background())?;
                let mut touched = store.find_by_id(witness)?;
                touched.owner = "audited".to_string();
                store.update_one(&mut touched, false)
            }
            Some("project-01") => Err(StorageError::invalid_argument("project-01 is protected")),
            _ => Ok(()),
        }
    });

    let store = db.storage.crud::<Project>(&Context::background()).unwrap();
    let err = store
        .delete_by_ids(&[projects[0].id, projects[1].id])
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    assert_eq!(store.find_by_id(witness).unwrap().owner, "alice");
    assert_eq!(db.project_count(), 3);
}
