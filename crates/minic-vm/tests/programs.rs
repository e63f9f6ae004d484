//! Whole-program scenarios exercising the compiler and VM together.

use minic_vm::compile;
use minic_vm::vm::Vm;

fn run(src: &str, args: &[&str]) -> i64 {
    let program = compile(src).expect("program should compile");
    Vm::new(&program).run(args).expect("program should run")
}

#[test]
fn iterative_fibonacci() {
    let src = "
        int fib(int n) {
            int a; int b; int t;
            a = 0; b = 1;
            while (n > 0) {
                t = a + b;
                a = b;
                b = t;
                n = n - 1;
            }
            return a;
        }
        int main() { return fib(10); }";
    assert_eq!(run(src, &["fib"]), 55);
}

#[test]
fn string_length_and_copy_through_char_pointers() {
    let src = "
        int strlen(char *s) {
            char *p;
            p = s;
            while (*p) p = p + 1;
            return p - s;
        }
        char *strcpy(char *dst, char *src) {
            char *d;
            d = dst;
            while (*src) {
                *d = *src;
                d = d + 1;
                src = src + 1;
            }
            *d = 0;
            return dst;
        }
        int main() {
            char *buf;
            buf = malloc(32);
            strcpy(buf, \"hello\");
            return strlen(buf);
        }";
    assert_eq!(run(src, &["str"]), 5);
}

#[test]
fn linked_list_built_with_malloc() {
    // A node is two cells: value, next.
    let src = "
        int main() {
            int *head; int *node; int i; int sum;
            head = 0;
            i = 1;
            while (i <= 5) {
                node = malloc(sizeof(int) * 2);
                node[0] = i;
                node[1] = (int)head;
                head = node;
                i = i + 1;
            }
            sum = 0;
            while (head) {
                sum = sum + head[0];
                head = (int *)head[1];
            }
            return sum;
        }";
    assert_eq!(run(src, &["list"]), 15);
}

#[test]
fn vowels_counted_in_a_program_argument() {
    let src = "
        int is_vowel(int c) {
            return c == 'a' || c == 'e' || c == 'i' || c == 'o' || c == 'u';
        }
        int main(int argc, char **argv) {
            char *s; int count;
            if (argc < 2) return 0 - 1;
            s = argv[1];
            count = 0;
            while (*s) {
                if (is_vowel(*s)) count = count + 1;
                s = s + 1;
            }
            return count;
        }";
    assert_eq!(run(src, &["vowels", "education"]), 5);
}

#[test]
fn nested_conditionals_classify() {
    let src = "
        int classify(int n) {
            if (n < 0) return 0 - 1;
            else if (n == 0) return 0;
            else if (n % 2) return 1;
            else return 2;
        }
        int main() {
            if (classify(0 - 9) != 0 - 1) return 1;
            if (classify(0) != 0) return 2;
            if (classify(7) != 1) return 3;
            if (classify(8) != 2) return 4;
            return 0;
        }";
    assert_eq!(run(src, &["classify"]), 0);
}

#[test]
fn a_guest_program_reads_a_host_file() {
    let path = std::env::temp_dir().join("minic-read-test.txt");
    std::fs::write(&path, b"MN").expect("fixture file should be writable");
    let src = "
        int main(int argc, char **argv) {
            int fd; int n; char *buf;
            if (argc < 2) return 0 - 1;
            fd = open(argv[1], 0);
            if (fd < 0) return 0 - 2;
            buf = malloc(16);
            n = read(fd, buf, 16);
            close(fd);
            if (n != 2) return 0 - 3;
            return buf[0] + buf[1];
        }";
    let path = path.to_str().expect("temp path should be valid utf-8");
    let status = run(src, &["readfile", path]);
    assert_eq!(status, i64::from(b'M') + i64::from(b'N'));
}

#[test]
fn global_state_machine_across_calls() {
    let src = "
        enum { Idle, Running, Done };
        int state;
        int step() {
            if (state == Idle) state = Running;
            else if (state == Running) state = Done;
            return state;
        }
        int main() {
            step();
            step();
            return state;
        }";
    assert_eq!(run(src, &["fsm"]), 2);
}

#[test]
fn compile_errors_surface_through_the_library_error_type() {
    let err: minic_vm::Error = compile("int main() { return oops; }").unwrap_err().into();
    let text = err.to_string();
    assert!(text.contains("compile error"), "got {text}");
    assert!(text.contains("undefined variable oops"), "got {text}");
}
