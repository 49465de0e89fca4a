use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE_NAME: &str = "biolearn.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS topics(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_topics_subject ON topics(subject_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS flashcards(
            id TEXT PRIMARY KEY,
            topic_id TEXT NOT NULL,
            order_number INTEGER NOT NULL,
            front_image TEXT,
            back_image TEXT,
            FOREIGN KEY(topic_id) REFERENCES topics(id),
            UNIQUE(topic_id, order_number)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_flashcards_topic ON flashcards(topic_id, order_number)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS reading_materials(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            title TEXT NOT NULL,
            order_number INTEGER NOT NULL,
            blocks TEXT NOT NULL,
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_reading_materials_subject
         ON reading_materials(subject_id, order_number)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS practice_questions(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            number INTEGER NOT NULL,
            question_text TEXT NOT NULL,
            flip_image_front TEXT,
            flip_image_back TEXT,
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_practice_questions_subject
         ON practice_questions(subject_id, number)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS answer_keys(
            question_id TEXT PRIMARY KEY,
            answer_text TEXT NOT NULL,
            FOREIGN KEY(question_id) REFERENCES practice_questions(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS scoring_rubrics(
            id TEXT PRIMARY KEY,
            question_id TEXT NOT NULL,
            score INTEGER NOT NULL,
            description TEXT NOT NULL,
            FOREIGN KEY(question_id) REFERENCES practice_questions(id),
            UNIQUE(question_id, score)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_scoring_rubrics_question
         ON scoring_rubrics(question_id, score)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            full_name TEXT NOT NULL,
            class_name TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_name, full_name)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_responses(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            question_id TEXT NOT NULL,
            answer_text TEXT NOT NULL,
            additional_answer TEXT,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(question_id) REFERENCES practice_questions(id),
            UNIQUE(student_id, question_id)
        )",
        [],
    )?;
    // Existing workspaces may have student_responses without the
    // self-review column. Add it if needed.
    ensure_responses_additional_answer(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_responses_student
         ON student_responses(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_responses_question
         ON student_responses(question_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS quiz_progress(
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            is_submitted INTEGER NOT NULL DEFAULT 0,
            submitted_at TEXT,
            PRIMARY KEY(student_id, subject_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_quiz_progress_subject ON quiz_progress(subject_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_responses_additional_answer(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "student_responses", "additional_answer")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE student_responses ADD COLUMN additional_answer TEXT",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
