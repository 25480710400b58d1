#![allow(dead_code)]

use rusqlite::types::Value;
use rusqlite::{Connection, Row};
use std::path::PathBuf;
use tabula_core::{Context, Entity, FieldSpec, Record, Storage, StorageError, StorageResult};
use tempfile::TempDir;

const FIXTURE_TABLES: &str = "
CREATE TABLE projects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    owner TEXT NOT NULL DEFAULT '',
    budget INTEGER NOT NULL DEFAULT 0,
    created_date INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    title TEXT NOT NULL,
    done INTEGER NOT NULL DEFAULT 0
);
";

/// File-backed storage with the fixture tables, removed on drop.
pub struct TestDb {
    pub storage: Storage,
    pub path: PathBuf,
    _dir: TempDir,
}

impl TestDb {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tabula.db");
        let storage = Storage::open_file(&path).unwrap();

        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(FIXTURE_TABLES).unwrap();
        drop(conn);

        Self {
            storage,
            path,
            _dir: dir,
        }
    }

    /// Plain connection for checks that must bypass the storage layer.
    pub fn raw(&self) -> Connection {
        Connection::open(&self.path).unwrap()
    }

    pub fn project_count(&self) -> i64 {
        self.raw()
            .query_row("SELECT COUNT(*) FROM projects", [], |row| row.get(0))
            .unwrap()
    }

    pub fn seed_projects(&self, count: usize) -> Vec<Project> {
        let store = self
            .storage
            .crud::<Project>(&Context::background())
            .unwrap();
        let mut projects = (0..count)
            .map(|index| Project::new(&format!("project-{index:02}"), "alice", index as i64))
            .collect::<Vec<_>>();
        store.create_many(&mut projects).unwrap();
        projects
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub owner: String,
    pub budget: i64,
    pub created_date: i64,
    /// Saved only through associations.
    pub tasks: Vec<Task>,
}

impl Project {
    pub fn new(name: &str, owner: &str, budget: i64) -> Self {
        Self {
            name: name.to_string(),
            owner: owner.to_string(),
            budget,
            ..Self::default()
        }
    }
}

const PROJECT_FIELDS: &[FieldSpec] = &[
    FieldSpec::column("id"),
    FieldSpec::column("name"),
    FieldSpec::column("owner"),
    FieldSpec::column("budget"),
    FieldSpec::renamed("created_date", "createdDate"),
];

impl Record for Project {
    fn fields() -> &'static [FieldSpec] {
        PROJECT_FIELDS
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.id),
            Value::Text(self.name.clone()),
            Value::Text(self.owner.clone()),
            Value::Integer(self.budget),
            Value::Integer(self.created_date),
        ]
    }
}

impl Entity for Project {
    fn table_name() -> &'static str {
        "projects"
    }

    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            owner: row.get("owner")?,
            budget: row.get("budget")?,
            created_date: row.get("created_date")?,
            tasks: Vec::new(),
        })
    }

    fn save_associations(&self, storage: &Storage) -> StorageResult<()> {
        let tasks = storage.crud::<Task>(&Context::background())?;
        for task in &self.tasks {
            if task.title.is_empty() {
                return Err(StorageError::invalid_argument("task title is required"));
            }
            let mut task = task.clone();
            task.project_id = self.id;
            tasks.update_one(&mut task, false)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Task {
    pub id: i64,
    pub project_id: i64,
    pub title: String,
    pub done: bool,
}

impl Task {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            ..Self::default()
        }
    }
}

const TASK_FIELDS: &[FieldSpec] = &[
    FieldSpec::column("id"),
    FieldSpec::renamed("project_id", "projectId"),
    FieldSpec::column("title"),
    FieldSpec::column("done"),
];

impl Record for Task {
    fn fields() -> &'static [FieldSpec] {
        TASK_FIELDS
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.id),
            Value::Integer(self.project_id),
            Value::Text(self.title.clone()),
            Value::Integer(i64::from(self.done)),
        ]
    }
}

impl Entity for Task {
    fn table_name() -> &'static str {
        "tasks"
    }

    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            title: row.get("title")?,
            done: row.get("done")?,
        })
    }
}

/// Narrow update of a project's name.
#[derive(Debug, Clone)]
pub struct ProjectName {
    pub id: i64,
    pub name: String,
}

const PROJECT_NAME_FIELDS: &[FieldSpec] = &[FieldSpec::column("id"), FieldSpec::column("name")];

impl Record for ProjectName {
    fn fields() -> &'static [FieldSpec] {
        PROJECT_NAME_FIELDS
    }

    fn values(&self) -> Vec<Value> {
        vec![Value::Integer(self.id), Value::Text(self.name.clone())]
    }
}

/// Projection missing the id column.
pub struct ProjectNameOnly {
    pub name: String,
}

const PROJECT_NAME_ONLY_FIELDS: &[FieldSpec] = &[FieldSpec::column("name")];

impl Record for ProjectNameOnly {
    fn fields() -> &'static [FieldSpec] {
        PROJECT_NAME_ONLY_FIELDS
    }

    fn values(&self) -> Vec<Value> {
        vec![Value::Text(self.name.clone())]
    }
}

/// Projection naming columns projects do not have.
pub struct ProjectBogus {
    pub id: i64,
}

const PROJECT_BOGUS_FIELDS: &[FieldSpec] = &[
    FieldSpec::column("id"),
    FieldSpec::column("color"),
    FieldSpec::column("size"),
];

impl Record for ProjectBogus {
    fn fields() -> &'static [FieldSpec] {
        PROJECT_BOGUS_FIELDS
    }

    fn values(&self) -> Vec<Value> {
        vec![Value::Integer(self.id), Value::Null, Value::Null]
    }
}
