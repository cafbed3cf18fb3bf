//! Job <-> Firestore document mapping.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Number};

use mflow_models::{Job, JobId, JobStatus, Task};

use super::types::{ArrayValue, Document, FromFirestoreValue, ToFirestoreValue, Value};
use crate::error::{StoreError, StoreResult};

pub const TASKS_FIELD: &str = "tasks";
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// Field path of a single task entry. Task IDs are quoted since they may
/// contain characters outside Firestore's simple field names.
pub fn task_field_path(task_id: &str) -> String {
    format!("{}.`{}`", TASKS_FIELD, task_id.replace('`', "\\`"))
}

pub fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::NullValue(()),
        serde_json::Value::Bool(b) => Value::BooleanValue(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::IntegerValue(i.to_string()),
            None => Value::DoubleValue(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => Value::StringValue(s.clone()),
        serde_json::Value::Array(items) => Value::ArrayValue(ArrayValue {
            values: Some(items.iter().map(json_to_value).collect()),
        }),
        serde_json::Value::Object(obj) => Value::map(
            obj.iter()
                .map(|(k, v)| (k.clone(), json_to_value(v)))
                .collect(),
        ),
    }
}

pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::NullValue(()) => serde_json::Value::Null,
        Value::BooleanValue(b) => serde_json::Value::Bool(*b),
        Value::IntegerValue(s) => s
            .parse::<i64>()
            .map(|i| serde_json::Value::Number(i.into()))
            .unwrap_or(serde_json::Value::Null),
        Value::DoubleValue(f) => Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::TimestampValue(s) | Value::StringValue(s) => serde_json::Value::String(s.clone()),
        Value::ArrayValue(a) => serde_json::Value::Array(
            a.values.iter().flatten().map(value_to_json).collect(),
        ),
        Value::MapValue(m) => serde_json::Value::Object(
            m.fields
                .iter()
                .flatten()
                .map(|(k, v)| (k.clone(), value_to_json(v)))
                .collect::<Map<_, _>>(),
        ),
    }
}

/// Map entry for one task. The entry key carries the task ID.
pub fn task_to_value(task: &Task, position: usize) -> StoreResult<Value> {
    let mut json = serde_json::to_value(task)
        .map_err(|e| StoreError::invalid_document(format!("task {}: {}", task.id, e)))?;
    if let Some(obj) = json.as_object_mut() {
        obj.remove("id");
        obj.insert("position".to_string(), serde_json::Value::from(position as u64));
    }
    Ok(json_to_value(&json))
}

fn task_from_value(task_id: &str, value: &Value) -> StoreResult<(i64, Task)> {
    let mut json = value_to_json(value);
    let obj = json
        .as_object_mut()
        .ok_or_else(|| StoreError::invalid_document(format!("task {} is not a map", task_id)))?;
    let position = obj
        .remove("position")
        .and_then(|p| p.as_i64())
        .unwrap_or(i64::MAX);
    // Absent optional fields are stored as nulls
    obj.retain(|_, v| !v.is_null());
    obj.insert("id".to_string(), serde_json::Value::String(task_id.to_string()));

    let task = serde_json::from_value(json)
        .map_err(|e| StoreError::invalid_document(format!("task {}: {}", task_id, e)))?;
    Ok((position, task))
}

/// All persisted fields of a job.
pub fn job_to_fields(job: &Job) -> StoreResult<HashMap<String, Value>> {
    let mut tasks = HashMap::with_capacity(job.tasks.len());
    for (position, task) in job.tasks.iter().enumerate() {
        tasks.insert(task.id.to_string(), task_to_value(task, position)?);
    }

    let mut fields = HashMap::new();
    fields.insert("mediaId".to_string(), job.media_id.to_firestore_value());
    fields.insert("sourceUrl".to_string(), job.source_url.to_firestore_value());
    fields.insert("status".to_string(), job.status.as_str().to_firestore_value());
    fields.insert("outputUrl".to_string(), job.output_url.to_firestore_value());
    fields.insert("error".to_string(), job.error.to_firestore_value());
    fields.insert("createdAt".to_string(), job.created_at.to_firestore_value());
    fields.insert(UPDATED_AT_FIELD.to_string(), job.updated_at.to_firestore_value());
    fields.insert(TASKS_FIELD.to_string(), Value::map(tasks));
    Ok(fields)
}

fn required<T: FromFirestoreValue>(doc: &Document, name: &str) -> StoreResult<T> {
    doc.field(name)
        .and_then(T::from_firestore_value)
        .ok_or_else(|| StoreError::invalid_document(format!("missing or invalid field {}", name)))
}

fn optional_string(doc: &Document, name: &str) -> Option<String> {
    doc.field(name).and_then(String::from_firestore_value)
}

/// Rebuild a job from its document. The revision is the document's update time.
pub fn job_from_document(doc: &Document) -> StoreResult<Job> {
    let id = doc
        .id()
        .ok_or_else(|| StoreError::invalid_document("document has no name"))?;

    let status: String = required(doc, "status")?;
    let status: JobStatus = status.parse().map_err(StoreError::invalid_document)?;

    let mut tasks = doc
        .field(TASKS_FIELD)
        .and_then(Value::as_map)
        .map(|entries| {
            entries
                .iter()
                .map(|(task_id, value)| task_from_value(task_id, value))
                .collect::<StoreResult<Vec<_>>>()
        })
        .transpose()?
        .unwrap_or_default();
    tasks.sort_by_key(|(position, _)| *position);

    Ok(Job {
        id: JobId::from_string(id),
        media_id: required(doc, "mediaId")?,
        source_url: required(doc, "sourceUrl")?,
        status,
        tasks: tasks.into_iter().map(|(_, t)| t).collect(),
        output_url: optional_string(doc, "outputUrl"),
        error: optional_string(doc, "error"),
        created_at: required::<DateTime<Utc>>(doc, "createdAt")?,
        updated_at: required::<DateTime<Utc>>(doc, UPDATED_AT_FIELD)?,
        revision: doc.update_time.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mflow_models::{
        SubtitleOutput, SubtitleTrack, TaskOutput, TaskStatus, TranscodeOutput, WorkerKind,
    };

    fn as_document(job: &Job) -> Document {
        let mut doc = Document::new(job_to_fields(job).unwrap());
        doc.name = Some(format!("projects/p/databases/(default)/documents/jobs/{}", job.id));
        doc.update_time = Some("2024-05-01T10:00:00.123456Z".into());
        doc
    }

    #[test]
    fn test_task_field_path() {
        assert_eq!(task_field_path("a-b"), "tasks.`a-b`");
    }

    #[test]
    fn test_job_round_trip() {
        let now = Utc::now();
        let mut job = Job::new("m1", "s3://m1.mp4", WorkerKind::Subtitle);
        job.tasks[0].apply_status(TaskStatus::Running, Some(10), now).unwrap();
        job.tasks[0].record_output(TaskOutput::Subtitle(SubtitleOutput {
            tracks: vec![SubtitleTrack {
                language: "en".into(),
                url: "s3://out/en.vtt".into(),
            }],
        }));
        job.tasks[0].apply_status(TaskStatus::Completed, None, now).unwrap();
        job.append_task(WorkerKind::Transcode);
        job.tasks[1].record_failure("exit 1", now);
        job.mark_failed("exit 1");

        let loaded = job_from_document(&as_document(&job)).unwrap();

        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.status, JobStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("exit 1"));
        assert_eq!(loaded.tasks, job.tasks);
        assert_eq!(loaded.revision.as_deref(), Some("2024-05-01T10:00:00.123456Z"));
    }

    #[test]
    fn test_task_order_follows_position() {
        let mut job = Job::new("m1", "s3://m1.mp4", WorkerKind::Thumbnail);
        for kind in [WorkerKind::Ai, WorkerKind::Subtitle, WorkerKind::Transcode] {
            job.append_task(kind);
        }
        job.tasks[3].record_output(TaskOutput::Transcode(TranscodeOutput {
            output_url: "s3://out/1080.mp4".into(),
            renditions: vec![],
        }));

        let loaded = job_from_document(&as_document(&job)).unwrap();
        let kinds: Vec<_> = loaded.tasks.iter().map(|t| t.worker_kind).collect();
        assert_eq!(
            kinds,
            vec![
                WorkerKind::Thumbnail,
                WorkerKind::Ai,
                WorkerKind::Subtitle,
                WorkerKind::Transcode
            ]
        );
    }

    #[test]
    fn test_missing_field_is_invalid() {
        let job = Job::new("m1", "s3://m1.mp4", WorkerKind::Thumbnail);
        let mut doc = as_document(&job);
        doc.fields.as_mut().unwrap().remove("mediaId");

        assert!(matches!(
            job_from_document(&doc),
            Err(StoreError::InvalidDocument(_))
        ));
    }
}
