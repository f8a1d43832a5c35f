use crate::proc::Process;
use core::ptr;

// Intrusive singly linked queues of processes, chained through
// Process::next. A process is on at most one list at a time; the
// scheduler's lock covers every mutation.

pub struct ProcList {
    head: *mut Process,
    tail: *mut Process,
}

unsafe impl Send for ProcList {}

impl ProcList {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    // add a process at the end of the list. O(1)
    pub fn append(&mut self, proc: *mut Process) {
        unsafe {
            (*proc).next = ptr::null_mut();
            if self.head.is_null() {
                self.head = proc;
                self.tail = proc;
            } else {
                (*self.tail).next = proc;
                self.tail = proc;
            }
        }
    }

    // add a process at the start of the list. O(1)
    pub fn prepend(&mut self, proc: *mut Process) {
        unsafe {
            if self.head.is_null() {
                (*proc).next = ptr::null_mut();
                self.head = proc;
                self.tail = proc;
            } else {
                (*proc).next = self.head;
                self.head = proc;
            }
        }
    }

    // extract the process at the start of the list. O(1)
    pub fn dequeue(&mut self) -> *mut Process {
        if self.head.is_null() {
            return ptr::null_mut();
        }
        unsafe {
            let proc = self.head;
            self.head = (*proc).next;
            if self.head.is_null() {
                self.tail = ptr::null_mut();
            }
            (*proc).next = ptr::null_mut();
            proc
        }
    }

    // remove a process from anywhere in the list. O(n)
    pub fn unlist(&mut self, proc: *mut Process) -> bool {
        if self.head == proc {
            self.dequeue();
            return true;
        }
        unsafe {
            let mut trailing = self.head;
            while !trailing.is_null() && (*trailing).next != proc {
                trailing = (*trailing).next;
            }
            if trailing.is_null() {
                return false; // not on this list
            }
            (*trailing).next = (*proc).next;
            if self.tail == proc {
                self.tail = trailing;
            }
            (*proc).next = ptr::null_mut();
            true
        }
    }

    pub fn iter(&self) -> Iter {
        Iter { cur: self.head }
    }
}

pub struct Iter {
    cur: *mut Process,
}

impl Iterator for Iter {
    type Item = *mut Process;

    fn next(&mut self) -> Option<*mut Process> {
        if self.cur.is_null() {
            return None;
        }
        let proc = self.cur;
        self.cur = unsafe { (*proc).next };
        Some(proc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::Process;

    fn procs(n: usize) -> Vec<Box<Process>> {
        (0..n).map(|i| Box::new(Process::bare(i as u32))).collect()
    }

    fn ids(list: &ProcList) -> Vec<u32> {
        list.iter().map(|p| unsafe { (*p).pid }).collect()
    }

    #[test]
    fn append_dequeue_is_fifo() {
        let mut ps = procs(3);
        let mut list = ProcList::new();
        for p in ps.iter_mut() {
            list.append(&mut **p);
        }
        assert_eq!(ids(&list), vec![0, 1, 2]);
        assert_eq!(unsafe { (*list.dequeue()).pid }, 0);
        assert_eq!(unsafe { (*list.dequeue()).pid }, 1);
        assert_eq!(unsafe { (*list.dequeue()).pid }, 2);
        assert!(list.dequeue().is_null());
        assert!(list.is_empty());
    }

    #[test]
    fn prepend_puts_head_of_line() {
        let mut ps = procs(3);
        let mut list = ProcList::new();
        list.append(&mut *ps[0]);
        list.append(&mut *ps[1]);
        list.prepend(&mut *ps[2]);
        assert_eq!(ids(&list), vec![2, 0, 1]);
    }

    #[test]
    fn unlist_from_head_middle_tail() {
        let mut ps = procs(4);
        let mut list = ProcList::new();
        for p in ps.iter_mut() {
            list.append(&mut **p);
        }

        assert!(list.unlist(&mut *ps[2])); // middle
        assert_eq!(ids(&list), vec![0, 1, 3]);
        assert!(list.unlist(&mut *ps[0])); // head
        assert_eq!(ids(&list), vec![1, 3]);
        assert!(list.unlist(&mut *ps[3])); // tail
        assert_eq!(ids(&list), vec![1]);

        // tail must still be maintained
        list.append(&mut *ps[0]);
        assert_eq!(ids(&list), vec![1, 0]);
    }

    #[test]
    fn unlist_missing_returns_false() {
        let mut ps = procs(2);
        let mut list = ProcList::new();
        list.append(&mut *ps[0]);
        assert!(!list.unlist(&mut *ps[1]));
        assert_eq!(ids(&list), vec![0]);
    }
}
