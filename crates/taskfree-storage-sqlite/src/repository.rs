//! Data access layer
//!
//! Bulk row accessors used to copy a store table by table, plus single-row
//! inserts for seeding.

use crate::models::{
    from_epoch_day, from_epoch_millis, to_epoch_day, to_epoch_millis, Category, Recurrence, Task,
    TaskStatus,
};
use crate::{Database, Result};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};

const TASK_COLUMNS: &str = "id, categoryId, text, due, baseDate, singleCategoryPageOrder, \
     allCategoryPageOrder, completedDate, recurrence, status, isArchived, reminderTime";

/// Repository for database operations
pub struct Repository<'a> {
    conn: &'a Connection,
}

impl<'a> Repository<'a> {
    /// Create repository
    pub fn new(db: &'a Database) -> Self {
        Self { conn: db.conn() }
    }

    /// Repository over a raw connection or open transaction
    pub fn from_conn(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// All categories, by id
    pub fn all_categories(&self) -> Result<Vec<Category>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, color, categoryPageOrder FROM Category ORDER BY id",
        )?;
        let categories = stmt
            .query_map([], |row| {
                Ok(Category {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    color: row.get(2)?,
                    category_page_order: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(categories)
    }

    /// Insert one category, returning its id
    pub fn insert_category(&self, category: &Category) -> Result<i64> {
        if category.id > 0 {
            self.replace_category(category)?;
            return Ok(category.id);
        }
        self.conn.execute(
            "INSERT INTO Category (title, color, categoryPageOrder) VALUES (?1, ?2, ?3)",
            params![category.title, category.color, category.category_page_order],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Insert categories keeping their ids, replacing rows with the same id
    pub fn insert_categories(&self, categories: &[Category]) -> Result<()> {
        for category in categories {
            self.replace_category(category)?;
        }
        Ok(())
    }

    fn replace_category(&self, category: &Category) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO Category (id, title, color, categoryPageOrder)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                category.id,
                category.title,
                category.color,
                category.category_page_order
            ],
        )?;
        Ok(())
    }

    /// Number of categories
    pub fn count_categories(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM Category", [], |row| row.get(0))?)
    }

    /// All tasks, by id
    pub fn all_tasks(&self) -> Result<Vec<Task>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM Task ORDER BY id", TASK_COLUMNS))?;
        let tasks = stmt
            .query_map([], task_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    /// Tasks in one category, in page order
    pub fn tasks_in_category(&self, category_id: i64) -> Result<Vec<Task>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM Task WHERE categoryId = ?1 ORDER BY singleCategoryPageOrder, id",
            TASK_COLUMNS
        ))?;
        let tasks = stmt
            .query_map([category_id], task_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    /// Insert one task, returning its id
    pub fn insert_task(&self, task: &Task) -> Result<i64> {
        if task.id > 0 {
            self.replace_task(task)?;
            return Ok(task.id);
        }
        self.conn.execute(
            "INSERT INTO Task (categoryId, text, due, baseDate, singleCategoryPageOrder,
                               allCategoryPageOrder, completedDate, recurrence, status,
                               isArchived, reminderTime)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                task.category_id,
                task.text,
                task.due.map(to_epoch_day),
                task.base_date.map(to_epoch_day),
                task.single_category_page_order,
                task.all_category_page_order,
                task.completed_date.map(to_epoch_day),
                task.recurrence.as_str(),
                task.status.as_str(),
                task.is_archived,
                task.reminder_time.map(to_epoch_millis),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Insert tasks keeping their ids, replacing rows with the same id
    pub fn insert_tasks(&self, tasks: &[Task]) -> Result<()> {
        for task in tasks {
            self.replace_task(task)?;
        }
        Ok(())
    }

    fn replace_task(&self, task: &Task) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO Task ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                TASK_COLUMNS
            ),
            params![
                task.id,
                task.category_id,
                task.text,
                task.due.map(to_epoch_day),
                task.base_date.map(to_epoch_day),
                task.single_category_page_order,
                task.all_category_page_order,
                task.completed_date.map(to_epoch_day),
                task.recurrence.as_str(),
                task.status.as_str(),
                task.is_archived,
                task.reminder_time.map(to_epoch_millis),
            ],
        )?;
        Ok(())
    }

    /// Number of tasks
    pub fn count_tasks(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM Task", [], |row| row.get(0))?)
    }

    /// Row count of a named data table
    pub fn count_rows(&self, table: &str) -> Result<i64> {
        match table {
            "Category" => self.count_categories(),
            "Task" => self.count_tasks(),
            other => Err(crate::Error::Validation(format!("Unknown table: {}", other))),
        }
    }
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let recurrence: String = row.get(8)?;
    let status: String = row.get(9)?;
    let reminder: Option<i64> = row.get(11)?;

    Ok(Task {
        id: row.get(0)?,
        category_id: row.get(1)?,
        text: row.get(2)?,
        due: epoch_day_column(row, 3)?,
        base_date: epoch_day_column(row, 4)?,
        single_category_page_order: row.get(5)?,
        all_category_page_order: row.get(6)?,
        completed_date: epoch_day_column(row, 7)?,
        recurrence: Recurrence::from_name(&recurrence).map_err(|e| conversion_error(8, e))?,
        status: TaskStatus::from_name(&status).map_err(|e| conversion_error(9, e))?,
        is_archived: row.get(10)?,
        reminder_time: match reminder {
            Some(ms) => Some(from_epoch_millis(ms).ok_or_else(|| {
                conversion_error(
                    11,
                    crate::Error::Validation(format!("Reminder out of range: {}", ms)),
                )
            })?),
            None => None,
        },
    })
}

fn epoch_day_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<chrono::NaiveDate>> {
    let days: Option<i64> = row.get(idx)?;
    match days {
        Some(days) => from_epoch_day(days).map(Some).ok_or_else(|| {
            conversion_error(
                idx,
                crate::Error::Validation(format!("Date out of range: {}", days)),
            )
        }),
        None => Ok(None),
    }
}

fn conversion_error(idx: usize, err: crate::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}
