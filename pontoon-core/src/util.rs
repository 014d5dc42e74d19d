use std::{
    borrow::Cow,
    sync::{Mutex, MutexGuard, PoisonError},
};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cap SQL text quoted in error contexts and logs.
pub(crate) fn truncate_long(sql: &str) -> Cow<'_, str> {
    const MAX: usize = 400;
    if sql.len() <= MAX {
        return Cow::Borrowed(sql);
    }
    let mut end = MAX;
    while !sql.is_char_boundary(end) {
        end -= 1;
    }
    Cow::Owned(format!("{}…", &sql[..end]))
}
